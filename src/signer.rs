/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Signed PROXY v2 header support. Grounded in
//! `maybeSendSignedPROXYHeader`/`shouldSendSignedPROXYHeader` in
//! original_source. Certificate validation and the mTLS/PKI behind the
//! signer are out of scope (§1); only the gating logic and the write live
//! here.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::MIN_IP_PROPAGATION_VERSION;

#[async_trait]
pub trait ProxySigner: Send + Sync {
    /// Produce a signed PROXY v2 header encoding `from` as source and
    /// `original_dst` as the original destination.
    async fn sign_proxy_header(&self, from: SocketAddr, original_dst: SocketAddr) -> Result<Vec<u8>>;
}

/// Extremely small, non-cryptographic "version >= min" check sufficient for
/// the dotted `major.minor.patch` versions this crate deals with. Returns
/// `true` when `version` is absent (nothing to gate) - callers should not
/// reach this path in that case, but we fail open to "don't block" rather
/// than silently dropping the header logic into a panic.
fn version_at_least(version: &str, min: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.').filter_map(|p| p.parse().ok()).collect()
    }
    let v = parts(version);
    let m = parts(min);
    if v.is_empty() {
        return false;
    }
    for i in 0..m.len().max(v.len()) {
        let vi = v.get(i).copied().unwrap_or(0);
        let mi = m.get(i).copied().unwrap_or(0);
        if vi != mi {
            return vi > mi;
        }
    }
    true
}

/// Mirrors `shouldSendSignedPROXYHeader`: skip when there's no signer, the
/// dial went over a tunnel, a version check was requested and the caller's
/// version is too old, or either address is missing.
pub fn should_send_signed_proxy_header(
    has_signer: bool,
    used_tunnel: bool,
    check_version: bool,
    caller_version: &str,
    from: Option<SocketAddr>,
    original_dst: Option<SocketAddr>,
) -> bool {
    if !has_signer || used_tunnel {
        return false;
    }
    if check_version && !version_at_least(caller_version, MIN_IP_PROPAGATION_VERSION) {
        return false;
    }
    from.is_some() && original_dst.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compare() {
        assert!(version_at_least("13.0.0", "13.0.0"));
        assert!(version_at_least("13.1.0", "13.0.0"));
        assert!(version_at_least("14.0.0", "13.0.0"));
        assert!(!version_at_least("12.9.9", "13.0.0"));
    }

    #[test]
    fn gating_requires_signer_and_both_addresses() {
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();
        assert!(!should_send_signed_proxy_header(false, false, true, "14.0.0", Some(addr), Some(addr)));
        assert!(!should_send_signed_proxy_header(true, true, true, "14.0.0", Some(addr), Some(addr)));
        assert!(!should_send_signed_proxy_header(true, false, true, "14.0.0", None, Some(addr)));
        assert!(!should_send_signed_proxy_header(true, false, true, "12.0.0", Some(addr), Some(addr)));
        assert!(should_send_signed_proxy_header(true, false, true, "14.0.0", Some(addr), Some(addr)));
        assert!(should_send_signed_proxy_header(true, false, false, "1.0.0", Some(addr), Some(addr)));
    }
}
