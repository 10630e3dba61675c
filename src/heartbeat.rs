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

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// Per-connection liveness state: `ready` (has heartbeated at least once),
/// `valid` (heartbeated recently enough), `last_heartbeat`, and the active
/// session counter. `ready`/`valid`/`last_heartbeat` are mutated only by the
/// owning heartbeat loop; `active_sessions` is the one field mutated from
/// elsewhere (the session-tracking dial wrapper), so it alone is atomic in
/// the narrower sense of "safe from any task, at any time".
#[derive(Debug, Default)]
pub struct HeartbeatState {
    ready: AtomicBool,
    valid: AtomicBool,
    last_heartbeat_millis: AtomicI64,
    active_sessions: AtomicUsize,
}

impl HeartbeatState {
    pub fn new() -> Self {
        HeartbeatState {
            ready: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            last_heartbeat_millis: AtomicI64::new(0),
            active_sessions: AtomicUsize::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn last_heartbeat_millis(&self) -> i64 {
        self.last_heartbeat_millis.load(Ordering::Acquire)
    }

    /// `last_heartbeat` never moves backward: a late or reordered update is
    /// silently dropped rather than rewinding the clock.
    pub fn set_last_heartbeat(&self, now_millis: i64) {
        self.last_heartbeat_millis
            .fetch_max(now_millis, Ordering::AcqRel);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn increment_active_sessions(&self) {
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_active_sessions(&self) {
        self.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    /// `true` once `now_millis` is at least `offline_for_millis` past the
    /// last heartbeat, i.e. the connection has been offline for at least
    /// that long and should be torn down.
    pub fn is_offline_for(&self, now_millis: i64, offline_for_millis: i64) -> bool {
        now_millis.saturating_sub(self.last_heartbeat_millis()) >= offline_for_millis
    }
}
