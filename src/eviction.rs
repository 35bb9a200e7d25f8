use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a registry knows about an entry nobody currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEntry {
    /// Time since the last lease was released.
    pub idle_for: Duration,
    /// Total number of leases handed out over the entry's lifetime.
    pub acquisitions: u64,
}

pub type EvictionPredicate = Arc<dyn Fn(&IdleEntry) -> bool + Send + Sync>;

/// Decides when an unreferenced registry entry is torn down.
#[derive(Clone, Default)]
pub enum EvictionPolicy {
    /// Keep entries for the lifetime of the registry.
    Never,
    /// Tear down as soon as the last lease is released.
    #[default]
    Immediate,
    /// Keep an idle entry around for a grace period.
    AfterDuration(Duration),
    /// Caller-supplied rule, evaluated on release and on every sweep.
    Custom(EvictionPredicate),
}

impl EvictionPolicy {
    pub fn custom(predicate: impl Fn(&IdleEntry) -> bool + Send + Sync + 'static) -> Self {
        EvictionPolicy::Custom(Arc::new(predicate))
    }

    pub fn should_evict(&self, idle: &IdleEntry) -> bool {
        match self {
            EvictionPolicy::Never => false,
            EvictionPolicy::Immediate => true,
            EvictionPolicy::AfterDuration(grace) => idle.idle_for >= *grace,
            EvictionPolicy::Custom(predicate) => predicate(idle),
        }
    }

    /// Grace period after which a timer should re-check an idle entry.
    pub fn grace_period(&self) -> Option<Duration> {
        match self {
            EvictionPolicy::AfterDuration(grace) => Some(*grace),
            _ => None,
        }
    }
}

impl fmt::Debug for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Never => write!(f, "Never"),
            EvictionPolicy::Immediate => write!(f, "Immediate"),
            EvictionPolicy::AfterDuration(grace) => write!(f, "AfterDuration({grace:?})"),
            EvictionPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(ms: u64, acquisitions: u64) -> IdleEntry {
        IdleEntry {
            idle_for: Duration::from_millis(ms),
            acquisitions,
        }
    }

    #[test]
    fn never_keeps_everything() {
        assert!(!EvictionPolicy::Never.should_evict(&idle(u64::MAX / 2, 1)));
    }

    #[test]
    fn immediate_evicts_on_release() {
        assert!(EvictionPolicy::Immediate.should_evict(&idle(0, 1)));
        assert!(EvictionPolicy::default().should_evict(&idle(0, 1)));
    }

    #[test]
    fn after_duration_waits_for_grace_period() {
        let policy = EvictionPolicy::AfterDuration(Duration::from_millis(200));
        assert!(!policy.should_evict(&idle(199, 1)));
        assert!(policy.should_evict(&idle(200, 1)));
        assert_eq!(policy.grace_period(), Some(Duration::from_millis(200)));
        assert_eq!(EvictionPolicy::Immediate.grace_period(), None);
    }

    #[test]
    fn custom_predicate_sees_idle_entry() {
        // keep entries that were popular
        let policy = EvictionPolicy::custom(|entry| entry.acquisitions < 3);
        assert!(policy.should_evict(&idle(0, 2)));
        assert!(!policy.should_evict(&idle(10_000, 3)));
        assert_eq!(format!("{policy:?}"), "Custom(..)");
    }
}
