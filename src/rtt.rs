//! Retransmission timeout estimation per server (Jacobson/Karels style).
//!
//! All values are milliseconds.

/// Timeout handed out for a server we know nothing about.
pub const UNKNOWN_SERVER_NICENESS: i32 = 376;
pub const RTT_MIN_TIMEOUT: i32 = 50;
pub const RTT_MAX_TIMEOUT: i32 = 120_000;

/// Clamp range for every suggested timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttBounds {
    pub min: i32,
    pub max: i32,
}

impl Default for RttBounds {
    fn default() -> Self {
        Self {
            min: RTT_MIN_TIMEOUT,
            max: RTT_MAX_TIMEOUT,
        }
    }
}

impl RttBounds {
    #[inline]
    fn clamp(&self, rto: i32) -> i32 {
        rto.max(self.min).min(self.max)
    }

    /// One second under the ceiling, never below the floor.
    pub fn retry_ceiling(&self) -> i32 {
        self.clamp(self.max.saturating_sub(1000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttInfo {
    /// smoothed rtt
    srtt: i32,
    /// smoothed mean deviation
    rttvar: i32,
    /// current timeout, including backoff
    rto: i32,
}

impl Default for RttInfo {
    fn default() -> Self {
        Self::new(&RttBounds::default())
    }
}

impl RttInfo {
    pub fn new(bounds: &RttBounds) -> Self {
        let mut rtt = Self {
            srtt: 0,
            rttvar: UNKNOWN_SERVER_NICENESS / 4,
            rto: 0,
        };
        rtt.rto = rtt.calc_rto(bounds);
        rtt
    }

    fn calc_rto(&self, bounds: &RttBounds) -> i32 {
        bounds.clamp(self.raw())
    }

    #[inline]
    fn raw(&self) -> i32 {
        self.srtt.saturating_add(self.rttvar.saturating_mul(4))
    }

    /// Timeout to use for the next query.
    #[inline]
    pub fn timeout(&self) -> i32 {
        self.rto
    }

    /// The estimate without any backoff applied.
    pub fn no_timeout(&self, bounds: &RttBounds) -> i32 {
        self.calc_rto(bounds)
    }

    /// Raw estimate, or the backed-off timeout while a backoff is active.
    pub fn unclamped(&self, bounds: &RttBounds) -> i32 {
        if self.calc_rto(bounds) != self.rto {
            return self.rto;
        }
        self.raw()
    }

    /// Fold in a measured round trip.
    pub fn update(&mut self, ms: i32, bounds: &RttBounds) {
        let delta = ms.saturating_sub(self.srtt);
        self.srtt = self.srtt.saturating_add(delta / 8);
        let dev = delta.saturating_abs();
        self.rttvar = self.rttvar.saturating_add(dev.saturating_sub(self.rttvar) / 4);
        self.rto = self.calc_rto(bounds);
    }

    /// A query sent with timeout `orig` got no answer: back off.
    pub fn lost(&mut self, orig: i32, bounds: &RttBounds) {
        // an answer already brought the timeout down meanwhile
        if self.rto < orig {
            return;
        }
        let doubled = orig.saturating_mul(2);
        if self.rto <= doubled {
            self.rto = doubled.min(bounds.max);
        }
    }

    /// Force the timeout, e.g. to pull a server back from the ceiling.
    pub(crate) fn set_timeout(&mut self, rto: i32, bounds: &RttBounds) {
        self.rto = bounds.clamp(rto);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_niceness_and_doubles_on_loss() {
        let b = RttBounds::default();
        let init = UNKNOWN_SERVER_NICENESS;
        let mut r = RttInfo::new(&b);
        assert_eq!(r.timeout(), init);
        r.lost(init, &b);
        assert_eq!(r.timeout(), init * 2);
        r.lost(init * 2, &b);
        assert_eq!(r.timeout(), init * 4);

        r.update(4000, &b);
        assert!(r.timeout() >= 2000);
        assert!(r.timeout() < 2 * 4000 + init * 4);

        r.lost(r.timeout(), &b);
        for _ in 0..100 {
            let before = r.timeout();
            r.lost(r.timeout(), &b);
            assert!(r.timeout() >= before);
            assert!(r.timeout() >= RTT_MIN_TIMEOUT);
            assert!(r.timeout() <= RTT_MAX_TIMEOUT);
        }
        assert_eq!(r.timeout(), RTT_MAX_TIMEOUT);
    }

    #[test]
    fn stale_loss_is_ignored() {
        let b = RttBounds::default();
        let mut r = RttInfo::new(&b);
        r.lost(UNKNOWN_SERVER_NICENESS, &b);
        r.update(20, &b);
        let after_reply = r.timeout();
        // loss report for a query sent with the old, larger timeout
        r.lost(UNKNOWN_SERVER_NICENESS * 2, &b);
        assert_eq!(r.timeout(), after_reply);
    }

    #[test]
    fn fast_server_never_drops_below_floor() {
        let b = RttBounds::default();
        let mut r = RttInfo::new(&b);
        for _ in 0..1000 {
            r.update(1, &b);
        }
        assert_eq!(r.timeout(), RTT_MIN_TIMEOUT);
    }

    #[test]
    fn custom_bounds_apply() {
        let b = RttBounds { min: 100, max: 1000 };
        let mut r = RttInfo::new(&b);
        for _ in 0..10 {
            r.lost(r.timeout(), &b);
        }
        assert_eq!(r.timeout(), 1000);
        for _ in 0..1000 {
            r.update(1, &b);
        }
        assert_eq!(r.timeout(), 100);
    }

    #[test]
    fn unclamped_reports_backoff() {
        let b = RttBounds::default();
        let mut r = RttInfo::new(&b);
        assert_eq!(r.unclamped(&b), UNKNOWN_SERVER_NICENESS);
        r.lost(UNKNOWN_SERVER_NICENESS, &b);
        assert_eq!(r.unclamped(&b), UNKNOWN_SERVER_NICENESS * 2);
        assert_eq!(r.no_timeout(&b), UNKNOWN_SERVER_NICENESS);
    }

    #[test]
    fn huge_sample_saturates_at_ceiling() {
        let b = RttBounds::default();
        let mut r = RttInfo::new(&b);
        r.update(2_000_000_000, &b);
        assert_eq!(r.timeout(), RTT_MAX_TIMEOUT);
        r.update(i32::MAX, &b);
        assert_eq!(r.timeout(), RTT_MAX_TIMEOUT);
        assert!(r.unclamped(&b) >= RTT_MAX_TIMEOUT);
        r.update(i32::MIN, &b);
        assert!(r.timeout() >= RTT_MIN_TIMEOUT && r.timeout() <= RTT_MAX_TIMEOUT);
    }

    #[test]
    fn retry_ceiling_respects_floor() {
        assert_eq!(RttBounds::default().retry_ceiling(), RTT_MAX_TIMEOUT - 1000);
        let narrow = RttBounds { min: 50, max: 500 };
        assert_eq!(narrow.retry_ceiling(), 50);
        let mut r = RttInfo::new(&narrow);
        r.set_timeout(-500, &narrow);
        assert_eq!(r.timeout(), 50);
    }
}
