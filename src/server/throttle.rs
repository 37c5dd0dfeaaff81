//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Asimap.
//
// Asimap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Asimap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Asimap. If not, see <http://www.gnu.org/licenses/>.

//! Failed-authentication throttling.
//!
//! A rolling window per connection source: once a source has accumulated
//! the maximum number of failures within the window, further attempts are
//! refused without consulting the password file at all, which both starves
//! brute-force attempts and keeps the (intentionally slow) hash
//! verification off the hot path of an attack.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(90);
const MAX_FAILURES: u32 = 3;

#[derive(Default)]
pub struct AuthThrottle {
    failures: HashMap<IpAddr, Vec<Instant>>,
}

impl AuthThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an authentication attempt from `source` may proceed.
    pub fn check_allow(&mut self, source: IpAddr) -> bool {
        self.check_allow_at(source, Instant::now())
    }

    /// Record a failed authentication from `source`.
    pub fn login_failed(&mut self, source: IpAddr) {
        self.login_failed_at(source, Instant::now())
    }

    fn check_allow_at(&mut self, source: IpAddr, now: Instant) -> bool {
        // Opportunistically shed dead entries so the table cannot grow
        // without bound under a spray attack.
        self.failures.retain(|_, times| {
            times.retain(|&t| now.duration_since(t) < WINDOW);
            !times.is_empty()
        });

        self.failures
            .get(&source)
            .map_or(true, |times| (times.len() as u32) < MAX_FAILURES)
    }

    fn login_failed_at(&mut self, source: IpAddr, now: Instant) {
        self.failures.entry(source).or_default().push(now);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn three_failures_then_lockout() {
        let mut throttle = AuthThrottle::new();
        let t0 = Instant::now();

        for n in 0..MAX_FAILURES {
            assert!(
                throttle.check_allow_at(ip(1), t0),
                "attempt {} should be allowed",
                n
            );
            throttle.login_failed_at(ip(1), t0);
        }

        // The fourth attempt inside the window is refused.
        assert!(!throttle.check_allow_at(ip(1), t0));
        // And stays refused for the remainder of the window.
        assert!(!throttle
            .check_allow_at(ip(1), t0 + Duration::from_secs(89)));

        // Other sources are unaffected.
        assert!(throttle.check_allow_at(ip(2), t0));
    }

    #[test]
    fn window_expiry_restores_access() {
        let mut throttle = AuthThrottle::new();
        let t0 = Instant::now();

        for _ in 0..MAX_FAILURES {
            throttle.login_failed_at(ip(1), t0);
        }
        assert!(!throttle.check_allow_at(ip(1), t0));
        assert!(
            throttle.check_allow_at(ip(1), t0 + Duration::from_secs(91))
        );
    }

    #[test]
    fn successful_sources_accumulate_no_state() {
        let mut throttle = AuthThrottle::new();
        let t0 = Instant::now();
        assert!(throttle.check_allow_at(ip(1), t0));
        assert!(throttle.failures.is_empty());
    }
}
