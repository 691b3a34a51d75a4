//! Engine options.
//!
//! Every option is a `key=value` string pair. [`Options::process`] and [`Options::process_bulk`]
//! validate the new value on a copy and only commit it when the whole set stays consistent, so a
//! rejected call never changes anything.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::util::constants::{BLOCK_SIZE, DEFAULT_HEAP_RESERVATION, MIN_HEAP_RESERVATION};
use crate::util::parse_size;

/// Prefix of environment variables read by [`Options::read_env_var_settings`].
pub const ENV_PREFIX: &str = "COMET_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("malformed option `{0}`, expected key=value")]
    Malformed(String),
    #[error("{0}")]
    Conflict(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanSelector {
    /// Allocate only. Running out of heap is an out-of-memory error.
    NoGC,
    /// Non-moving mark-sweep, every collection is full-heap.
    MarkSweep,
    /// Mark-sweep with sticky mark bits: nursery collections reclaim objects allocated since the
    /// previous cycle and rely on the object-remembering barrier.
    StickyMarkSweep,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BarrierSelector {
    NoBarrier,
    ObjectBarrier,
    SATBBarrier,
}

impl BarrierSelector {
    pub fn name(self) -> &'static str {
        match self {
            Self::NoBarrier => "NoBarrier",
            Self::ObjectBarrier => "ObjectBarrier",
            Self::SATBBarrier => "SATBBarrier",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcTriggerSelector {
    FixedHeapSize(usize),
    DynamicHeapSize(usize, usize),
}

impl GcTriggerSelector {
    /// `(min, max)` heap bounds in bytes.
    pub fn bounds(self) -> (usize, usize) {
        match self {
            Self::FixedHeapSize(size) => (size, size),
            Self::DynamicHeapSize(min, max) => (min, max),
        }
    }

    /// A fixed trigger when both bounds agree, a dynamic one otherwise.
    pub fn from_bounds(min: usize, max: usize) -> Self {
        if min == max {
            Self::FixedHeapSize(max)
        } else {
            Self::DynamicHeapSize(min, max)
        }
    }
}

macro_rules! selector_from_str {
    ($t: ident { $($variant: ident),* }) => {
        impl FromStr for $t {
            type Err = ();
            fn from_str(s: &str) -> Result<Self, ()> {
                match s {
                    $(stringify!($variant) => Ok(Self::$variant),)*
                    _ => Err(()),
                }
            }
        }
    };
}

selector_from_str!(PlanSelector { NoGC, MarkSweep, StickyMarkSweep });
selector_from_str!(BarrierSelector { NoBarrier, ObjectBarrier, SATBBarrier });

impl FromStr for GcTriggerSelector {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        let (kind, args) = s.split_once(':').ok_or(())?;
        match kind {
            "FixedHeapSize" => parse_size(args).map(Self::FixedHeapSize).ok_or(()),
            "DynamicHeapSize" => {
                let (min, max) = args.split_once(',').ok_or(())?;
                let min = parse_size(min).ok_or(())?;
                let max = parse_size(max).ok_or(())?;
                Ok(Self::DynamicHeapSize(min, max))
            }
            _ => Err(()),
        }
    }
}

impl fmt::Display for GcTriggerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedHeapSize(size) => write!(f, "FixedHeapSize:{}", size),
            Self::DynamicHeapSize(min, max) => write!(f, "DynamicHeapSize:{},{}", min, max),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    pub plan: PlanSelector,
    /// Explicit barrier; the plan's own choice when unset.
    pub barrier: Option<BarrierSelector>,
    /// Number of collector workers.
    pub threads: usize,
    pub gc_trigger: GcTriggerSelector,
    /// Address space reserved up front for all spaces.
    pub heap_reservation: usize,
    /// How fast the collection trigger grows relative to live bytes.
    pub heap_growth_factor: f64,
    /// Collect every time this many bytes have been handed out.
    pub stress_factor: usize,
    pub no_reference_types: bool,
    pub no_finalizer: bool,
    pub ignore_system_gc: bool,
    pub full_heap_system_gc: bool,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            plan: PlanSelector::MarkSweep,
            barrier: None,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            gc_trigger: GcTriggerSelector::DynamicHeapSize(16 << 20, 512 << 20),
            heap_reservation: DEFAULT_HEAP_RESERVATION,
            heap_growth_factor: 1.5,
            stress_factor: usize::MAX,
            no_reference_types: false,
            no_finalizer: false,
            ignore_system_gc: false,
            full_heap_system_gc: false,
            verbose: false,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Options {
    /// The barrier the engine will run with.
    pub fn effective_barrier(&self) -> BarrierSelector {
        self.barrier.unwrap_or(match self.plan {
            PlanSelector::StickyMarkSweep => BarrierSelector::ObjectBarrier,
            PlanSelector::NoGC | PlanSelector::MarkSweep => BarrierSelector::NoBarrier,
        })
    }

    pub fn heap_bounds(&self) -> (usize, usize) {
        self.gc_trigger.bounds()
    }

    /// Parse and store one option without checking it against the others.
    fn set(&mut self, key: &str, value: &str) -> Result<(), OptionError> {
        let invalid = || OptionError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();
        match key {
            "plan" => self.plan = value.parse().map_err(|_| invalid())?,
            "barrier" => self.barrier = Some(value.parse().map_err(|_| invalid())?),
            "threads" => {
                self.threads = value
                    .parse::<usize>()
                    .ok()
                    .filter(|threads| *threads > 0)
                    .ok_or_else(invalid)?
            }
            "gc_trigger" => self.gc_trigger = value.parse().map_err(|_| invalid())?,
            "heap_reservation" => self.heap_reservation = parse_size(value).ok_or_else(invalid)?,
            "heap_growth_factor" => {
                self.heap_growth_factor = value
                    .parse::<f64>()
                    .ok()
                    .filter(|factor| factor.is_finite() && *factor >= 1.0)
                    .ok_or_else(invalid)?
            }
            "stress_factor" => {
                self.stress_factor = parse_size(value)
                    .filter(|factor| *factor > 0)
                    .ok_or_else(invalid)?
            }
            "no_reference_types" => self.no_reference_types = parse_bool(value).ok_or_else(invalid)?,
            "no_finalizer" => self.no_finalizer = parse_bool(value).ok_or_else(invalid)?,
            "ignore_system_gc" => self.ignore_system_gc = parse_bool(value).ok_or_else(invalid)?,
            "full_heap_system_gc" => {
                self.full_heap_system_gc = parse_bool(value).ok_or_else(invalid)?
            }
            "verbose" => self.verbose = parse_bool(value).ok_or_else(invalid)?,
            _ => return Err(OptionError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Check constraints spanning several options.
    pub fn validate(&self) -> Result<(), OptionError> {
        if self.heap_reservation < MIN_HEAP_RESERVATION || self.heap_reservation % BLOCK_SIZE != 0
        {
            return Err(OptionError::Conflict(format!(
                "heap_reservation must be a multiple of {} and at least {} bytes",
                BLOCK_SIZE, MIN_HEAP_RESERVATION
            )));
        }
        let (min, max) = self.heap_bounds();
        if min == 0 || min > max {
            return Err(OptionError::Conflict(format!(
                "gc_trigger bounds {}..{} are empty",
                min, max
            )));
        }
        if max > self.heap_reservation {
            return Err(OptionError::Conflict(format!(
                "gc_trigger maximum {} exceeds heap_reservation {}",
                max, self.heap_reservation
            )));
        }
        if self.plan == PlanSelector::StickyMarkSweep
            && self.effective_barrier() != BarrierSelector::ObjectBarrier
        {
            return Err(OptionError::Conflict(
                "StickyMarkSweep requires the ObjectBarrier".to_string(),
            ));
        }
        Ok(())
    }

    /// Set one option. Nothing changes unless the resulting option set is valid.
    pub fn process(&mut self, key: &str, value: &str) -> Result<(), OptionError> {
        let mut next = self.clone();
        next.set(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Set whitespace separated `key=value` pairs, all or nothing.
    pub fn process_bulk(&mut self, options: &str) -> Result<(), OptionError> {
        let mut next = self.clone();
        for pair in options.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| OptionError::Malformed(pair.to_string()))?;
            next.set(key, value)?;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Apply `COMET_<KEY>` environment variables. Invalid ones are logged and skipped.
    pub fn read_env_var_settings(&mut self) {
        for (name, value) in std::env::vars() {
            let key = match name.strip_prefix(ENV_PREFIX) {
                Some(key) => key.to_ascii_lowercase(),
                None => continue,
            };
            if let Err(err) = self.process(&key, &value) {
                log::warn!("ignoring {}: {}", name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = Options::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.effective_barrier(), BarrierSelector::NoBarrier);
    }

    #[test]
    fn single_option() {
        let mut options = Options::default();
        options.process("plan", "StickyMarkSweep").unwrap();
        assert_eq!(options.effective_barrier(), BarrierSelector::ObjectBarrier);
        options.process("gc_trigger", "DynamicHeapSize:4M,64M").unwrap();
        assert_eq!(options.heap_bounds(), (4 << 20, 64 << 20));
        assert_eq!(
            options.process("threads", "0"),
            Err(OptionError::InvalidValue {
                key: "threads".into(),
                value: "0".into()
            })
        );
        assert_eq!(
            options.process("no_such_option", "1"),
            Err(OptionError::UnknownKey("no_such_option".into()))
        );
    }

    #[test]
    fn rejected_option_leaves_state_unchanged() {
        let mut options = Options::default();
        options.process("plan", "StickyMarkSweep").unwrap();
        let before = options.clone();
        assert!(matches!(
            options.process("barrier", "SATBBarrier"),
            Err(OptionError::Conflict(_))
        ));
        assert_eq!(options, before);
    }

    #[test]
    fn bulk_is_all_or_nothing() {
        let mut options = Options::default();
        let before = options.clone();
        assert!(options
            .process_bulk("threads=3 plan=NoGC heap_growth_factor=0.5")
            .is_err());
        assert_eq!(options, before);
        assert!(options.process_bulk("threads=3 bogus").is_err());
        assert_eq!(options, before);

        options
            .process_bulk("threads=3  plan=NoGC\tgc_trigger=FixedHeapSize:32M verbose=true")
            .unwrap();
        assert_eq!(options.threads, 3);
        assert_eq!(options.plan, PlanSelector::NoGC);
        assert_eq!(options.gc_trigger, GcTriggerSelector::FixedHeapSize(32 << 20));
        assert!(options.verbose);
    }

    #[test]
    fn trigger_bounds_must_fit_the_reservation() {
        let mut options = Options::default();
        assert!(options.process("gc_trigger", "DynamicHeapSize:64M,4M").is_err());
        assert!(options.process("gc_trigger", "FixedHeapSize:2G").is_err());
        options.process("gc_trigger", "FixedHeapSize:64M").unwrap();
        assert!(options.process("heap_reservation", "32M").is_err());
        assert_eq!(options.heap_reservation, DEFAULT_HEAP_RESERVATION);
    }
}
