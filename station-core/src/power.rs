// Battery-aware interval stretching and sleep planning

/// Battery readings below this are treated as "no battery connected"
pub const NO_BATTERY_VOLTS: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSave {
    /// Below this voltage intervals start to grow
    pub threshold: f32,
    /// Extra fraction of the base interval added per volt of deficit
    pub scale: f32,
}

impl Default for PowerSave {
    fn default() -> Self {
        Self {
            threshold: 3.6,
            scale: 10.0,
        }
    }
}

impl PowerSave {
    /// Effective interval for a base interval given the averaged battery
    /// voltage: the base while the battery is at or above threshold, then
    /// `ceil(base * (1 + scale * deficit))`. Never shorter than the base.
    pub fn effective_interval(&self, base_secs: u32, battery: Option<f32>) -> u32 {
        let Some(volts) = battery else {
            return base_secs;
        };
        if !volts.is_finite() || volts >= self.threshold || volts < NO_BATTERY_VOLTS {
            return base_secs;
        }
        let deficit = f64::from(self.threshold - volts);
        let scale = f64::from(self.scale.max(0.0));
        let stretched = (f64::from(base_secs) * (1.0 + scale * deficit)).ceil();
        if stretched >= f64::from(u32::MAX) {
            return u32::MAX;
        }
        (stretched as u32).max(base_secs)
    }

    pub fn is_active(&self, battery: Option<f32>) -> bool {
        self.effective_interval(1000, battery) > 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub duration_ms: u64,
    /// Processing ran past the interval and the full interval was used
    pub overran: bool,
}

/// Time left in this interval after `elapsed_ms` of work. When that would be
/// shorter than `min_sleep_ms` the full interval is slept instead.
pub fn plan_sleep(interval_ms: u64, elapsed_ms: u64, min_sleep_ms: u64) -> SleepPlan {
    match interval_ms.checked_sub(elapsed_ms) {
        Some(remaining) if remaining >= min_sleep_ms => SleepPlan {
            duration_ms: remaining,
            overran: false,
        },
        _ => SleepPlan {
            duration_ms: interval_ms.max(min_sleep_ms),
            overran: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_full_battery_keeps_base_interval() {
        let ps = PowerSave::default();
        assert_eq!(ps.effective_interval(60, Some(4.1)), 60);
        assert_eq!(ps.effective_interval(60, Some(3.6)), 60);
        assert!(!ps.is_active(Some(3.9)));
    }

    #[test]
    fn test_missing_battery_keeps_base_interval() {
        let ps = PowerSave::default();
        assert_eq!(ps.effective_interval(60, None), 60);
        assert_eq!(ps.effective_interval(60, Some(0.4)), 60);
        assert_eq!(ps.effective_interval(60, Some(f32::NAN)), 60);
    }

    #[test]
    fn test_deficit_stretches_linearly() {
        let ps = PowerSave {
            threshold: 3.6,
            scale: 10.0,
        };
        // 0.1 V short: 60 * (1 + 1.0) = 120
        assert_eq!(ps.effective_interval(60, Some(3.5)), 120);
        // 0.3 V short: 60 * 4 = 240
        assert_eq!(ps.effective_interval(60, Some(3.3)), 240);
        assert!(ps.is_active(Some(3.5)));
    }

    #[test]
    fn test_zero_scale_disables_stretching() {
        let ps = PowerSave {
            threshold: 3.6,
            scale: 0.0,
        };
        assert_eq!(ps.effective_interval(300, Some(3.0)), 300);
    }

    #[test]
    fn test_sleep_subtracts_elapsed() {
        assert_eq!(
            plan_sleep(60_000, 1_250, 100),
            SleepPlan {
                duration_ms: 58_750,
                overran: false
            }
        );
    }

    #[test]
    fn test_overrun_sleeps_full_interval() {
        let plan = plan_sleep(60_000, 61_000, 100);
        assert!(plan.overran);
        assert_eq!(plan.duration_ms, 60_000);

        let plan = plan_sleep(60_000, 59_950, 100);
        assert!(plan.overran);
        assert_eq!(plan.duration_ms, 60_000);
    }

    proptest! {
        #[test]
        fn prop_interval_never_shrinks_as_voltage_drops(
            base in 1u32..86_400,
            threshold in 2.5f32..4.2,
            scale in 0.0f32..200.0,
            high in 2.0f32..4.5,
            drop in 0.0f32..2.0,
        ) {
            let ps = PowerSave { threshold, scale };
            let low = high - drop;
            let at_high = ps.effective_interval(base, Some(high));
            prop_assert!(at_high >= base);
            if low >= NO_BATTERY_VOLTS {
                prop_assert!(ps.effective_interval(base, Some(low)) >= at_high);
            }
            if high >= threshold {
                prop_assert_eq!(at_high, base);
            }
        }

        #[test]
        fn prop_sleep_is_never_below_minimum(
            interval in 1u64..3_600_000,
            elapsed in 0u64..3_600_000,
            min in 0u64..1_000,
        ) {
            let plan = plan_sleep(interval, elapsed, min);
            prop_assert!(plan.duration_ms >= min);
            prop_assert!(plan.duration_ms <= interval.max(min));
        }
    }
}
