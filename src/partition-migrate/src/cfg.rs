// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tunable knobs of the migration engine.
//!
//! Each knob is a typed, named [`Config`] constant with a default and a
//! description. All of them are registered to a [`ConfigSet`] with
//! [`all_configs`]; values in a set are shared, so an operator can retune a
//! running migration (e.g. shrink the batch size under load) by applying
//! [`ConfigUpdates`] to the set the engine was given.
//!
//! ```
//! # use mz_partition_migrate::cfg::{all_configs, ConfigSet, ConfigUpdates, BACKFILL_BATCH_SIZE};
//! let cfg = all_configs(ConfigSet::default());
//! assert_eq!(BACKFILL_BATCH_SIZE.get(&cfg), 1_000);
//! let mut updates = ConfigUpdates::default();
//! updates.add_str("backfill_batch_size", "250");
//! updates.apply(&cfg).unwrap();
//! assert_eq!(BACKFILL_BATCH_SIZE.get(&cfg), 250);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

/// Rows per backfill batch.
pub const BACKFILL_BATCH_SIZE: Config<usize> = Config::new(
    "backfill_batch_size",
    1_000,
    "Maximum number of source rows copied by one backfill batch.",
);

/// Concurrent identity ranges in the backfill main pass.
pub const BACKFILL_PARALLELISM: Config<usize> = Config::new(
    "backfill_parallelism",
    1,
    "Number of disjoint identity key ranges the backfill main pass copies concurrently.",
);

pub const BACKFILL_BATCH_MAX_ATTEMPTS: Config<u32> = Config::new(
    "backfill_batch_max_attempts",
    5,
    "Attempts per backfill batch before a transient database error is surfaced.",
);

pub const BACKFILL_RECONCILIATION_RETRIES: Config<u32> = Config::new(
    "backfill_reconciliation_retries",
    1,
    "Extra reconciliation passes run while rows are still missing from the target.",
);

pub const VERIFY_SAMPLE_SIZE: Config<usize> = Config::new(
    "verify_sample_size",
    100,
    "Number of source rows compared column by column during a deep check.",
);

pub const CUTOVER_LOCK_TIMEOUT: Config<Duration> = Config::new(
    "cutover_lock_timeout",
    Duration::from_secs(5),
    "How long cutover waits for exclusive locks on source and target before aborting.",
);

pub const RESTORE_STATEMENT_TIMEOUT: Config<Duration> = Config::new(
    "restore_statement_timeout",
    Duration::from_secs(60 * 60),
    "Statement timeout for index builds and constraint validation.",
);

pub const RESTORE_LOCK_TIMEOUT: Config<Duration> = Config::new(
    "restore_lock_timeout",
    Duration::from_secs(5),
    "How long constraint restoration waits for a lock that blocks writers to the target.",
);

pub const RESTORE_LOCK_MAX_ATTEMPTS: Config<u32> = Config::new(
    "restore_lock_max_attempts",
    5,
    "Attempts per restore step whose lock wait timed out before the error is surfaced.",
);

pub const VERIFY_DEEP_CHECK: Config<bool> = Config::new(
    "verify_deep_check",
    true,
    "Whether verification gates also compare sampled rows column by column.",
);

/// Registers every config of this crate to `set`.
pub fn all_configs(set: ConfigSet) -> ConfigSet {
    set.add(&BACKFILL_BATCH_SIZE)
        .add(&BACKFILL_PARALLELISM)
        .add(&BACKFILL_BATCH_MAX_ATTEMPTS)
        .add(&BACKFILL_RECONCILIATION_RETRIES)
        .add(&VERIFY_SAMPLE_SIZE)
        .add(&VERIFY_DEEP_CHECK)
        .add(&CUTOVER_LOCK_TIMEOUT)
        .add(&RESTORE_STATEMENT_TIMEOUT)
        .add(&RESTORE_LOCK_TIMEOUT)
        .add(&RESTORE_LOCK_MAX_ATTEMPTS)
}

/// A handle to a named, typed configuration value.
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T,
}

impl<T: ConfigType> Config<T> {
    pub const fn new(name: &'static str, default: T, desc: &'static str) -> Self {
        Config {
            name,
            default,
            desc,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn desc(&self) -> &str {
        self.desc
    }

    pub fn default(&self) -> &T {
        &self.default
    }

    /// Returns the latest value of this config within the given set, or its
    /// default if it was never registered there.
    pub fn get(&self, set: &ConfigSet) -> T {
        match T::shared(self, set) {
            Some(shared) => T::get(shared),
            None => self.default.clone(),
        }
    }

    /// Sets the value of this config within the given set. Returns false if the
    /// config is not registered there.
    pub fn set(&self, set: &ConfigSet, val: T) -> bool {
        match T::shared(self, set) {
            Some(shared) => {
                T::set(shared, val);
                true
            }
            None => false,
        }
    }
}

/// A type usable as a [`Config`].
pub trait ConfigType: Sized + Clone {
    /// The value shared between updaters and readers of a config.
    type Shared;

    fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>>;

    fn to_val(val: &Self) -> ConfigVal;

    fn get(x: &Self::Shared) -> Self;

    fn set(x: &Self::Shared, val: Self);

    /// Parses the textual form used by [`ConfigUpdates`].
    fn parse(s: &str) -> Result<Self, String>;
}

/// A set of [`Config`]s with values independent of other sets.
#[derive(Clone, Default)]
pub struct ConfigSet {
    configs: BTreeMap<String, ConfigEntry>,
}

impl ConfigSet {
    /// Adds the given config to this set.
    ///
    /// Registering a name twice keeps the first registration.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        self.configs
            .entry(config.name.to_owned())
            .or_insert_with(|| ConfigEntry {
                name: config.name,
                desc: config.desc,
                default: T::to_val(&config.default),
                val: T::to_val(&config.default),
            });
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configs.values()
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ConfigSet { configs } = self;
        f.debug_map()
            .entries(configs.iter().map(|(name, entry)| (name, entry.val())))
            .finish()
    }
}

/// An entry for a config in a [`ConfigSet`].
#[derive(Clone, Debug)]
pub struct ConfigEntry {
    name: &'static str,
    desc: &'static str,
    default: ConfigVal,
    val: ConfigVal,
}

impl ConfigEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// The default value of this config. Never updated.
    pub fn default(&self) -> &ConfigVal {
        &self.default
    }

    pub fn val(&self) -> &ConfigVal {
        &self.val
    }
}

/// A type-erased [`ConfigType::Shared`].
#[derive(Clone, Debug)]
pub enum ConfigVal {
    Bool(Arc<AtomicBool>),
    U32(Arc<AtomicU32>),
    Usize(Arc<AtomicU64>),
    Duration(Arc<RwLock<Duration>>),
}

impl fmt::Display for ConfigVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigVal::Bool(x) => write!(f, "{}", bool::get(x)),
            ConfigVal::U32(x) => write!(f, "{}", u32::get(x)),
            ConfigVal::Usize(x) => write!(f, "{}", usize::get(x)),
            ConfigVal::Duration(x) => {
                write!(f, "{}", humantime::format_duration(Duration::get(x)))
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown config {0}")]
    Unknown(String),
    #[error("invalid value {value:?} for config {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// A batch of textual config overrides, keyed by config name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigUpdates {
    updates: BTreeMap<String, String>,
}

impl ConfigUpdates {
    /// Adds an override. A later override of the same name replaces an earlier
    /// one.
    pub fn add_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.updates.insert(name.into(), value.into());
    }

    /// Adds the current value of the given entry.
    pub fn add(&mut self, entry: &ConfigEntry) {
        self.add_str(entry.name, entry.val.to_string());
    }

    /// Adds the entries in `other` to `self`, with `other` taking precedence.
    pub fn extend(&mut self, other: Self) {
        self.updates.extend(other.updates)
    }

    /// Applies these updates to the given set.
    ///
    /// Every update is parsed before any is applied, so a bad value leaves the
    /// set untouched.
    pub fn apply(&self, set: &ConfigSet) -> Result<(), ConfigError> {
        fn parse<T: ConfigType>(name: &str, value: &str) -> Result<T, ConfigError> {
            T::parse(value).map_err(|reason| ConfigError::InvalidValue {
                name: name.to_owned(),
                value: value.to_owned(),
                reason,
            })
        }

        let mut parsed = Vec::with_capacity(self.updates.len());
        for (name, value) in &self.updates {
            let entry = set
                .configs
                .get(name)
                .ok_or_else(|| ConfigError::Unknown(name.clone()))?;
            let update: Box<dyn Fn() + '_> = match &entry.val {
                ConfigVal::Bool(dst) => {
                    let v = parse::<bool>(name, value)?;
                    Box::new(move || bool::set(dst, v))
                }
                ConfigVal::U32(dst) => {
                    let v = parse::<u32>(name, value)?;
                    Box::new(move || u32::set(dst, v))
                }
                ConfigVal::Usize(dst) => {
                    let v = parse::<usize>(name, value)?;
                    Box::new(move || usize::set(dst, v))
                }
                ConfigVal::Duration(dst) => {
                    let v = parse::<Duration>(name, value)?;
                    Box::new(move || Duration::set(dst, v))
                }
            };
            parsed.push((name, value, update));
        }
        for (name, value, update) in parsed {
            info!(config = %name, value = %value, "applying config update");
            update();
        }
        Ok(())
    }
}

mod impls {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::SeqCst};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use super::{Config, ConfigSet, ConfigType, ConfigVal};

    impl ConfigType for bool {
        type Shared = AtomicBool;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)?.val() {
                ConfigVal::Bool(x) => Some(x),
                _ => None,
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Bool(Arc::new((*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(val, SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            x.load(SeqCst)
        }
        fn parse(s: &str) -> Result<Self, String> {
            s.trim().parse().map_err(|e| format!("{}", e))
        }
    }

    impl ConfigType for u32 {
        type Shared = AtomicU32;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)?.val() {
                ConfigVal::U32(x) => Some(x),
                _ => None,
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::U32(Arc::new((*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(val, SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            x.load(SeqCst)
        }
        fn parse(s: &str) -> Result<Self, String> {
            s.trim().parse().map_err(|e| format!("{}", e))
        }
    }

    impl ConfigType for usize {
        type Shared = AtomicU64;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)?.val() {
                ConfigVal::Usize(x) => Some(x),
                _ => None,
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Usize(Arc::new(u64::try_from(*val).unwrap_or(u64::MAX).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(u64::try_from(val).unwrap_or(u64::MAX), SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            usize::try_from(x.load(SeqCst)).unwrap_or(usize::MAX)
        }
        fn parse(s: &str) -> Result<Self, String> {
            s.trim().parse().map_err(|e| format!("{}", e))
        }
    }

    impl ConfigType for Duration {
        type Shared = RwLock<Duration>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)?.val() {
                ConfigVal::Duration(x) => Some(x),
                _ => None,
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Duration(Arc::new(RwLock::new(*val)))
        }
        fn set(x: &Self::Shared, val: Self) {
            *x.write().unwrap_or_else(|e| e.into_inner()) = val;
        }
        fn get(x: &Self::Shared) -> Self {
            *x.read().unwrap_or_else(|e| e.into_inner())
        }
        fn parse(s: &str) -> Result<Self, String> {
            humantime::parse_duration(s.trim()).map_err(|e| format!("{}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOL: Config<bool> = Config::new("bool", true, "");
    const USIZE: Config<usize> = Config::new("usize", 1, "");
    const DURATION: Config<Duration> = Config::new("duration", Duration::from_secs(1), "");

    #[test]
    fn all_types() {
        let configs = ConfigSet::default().add(&BOOL).add(&USIZE).add(&DURATION);
        assert!(BOOL.get(&configs));
        assert_eq!(USIZE.get(&configs), 1);
        assert_eq!(DURATION.get(&configs), Duration::from_secs(1));

        assert!(BOOL.set(&configs, false));
        assert!(USIZE.set(&configs, 2));
        assert!(DURATION.set(&configs, Duration::from_millis(5)));
        assert!(!BOOL.get(&configs));
        assert_eq!(USIZE.get(&configs), 2);
        assert_eq!(DURATION.get(&configs), Duration::from_millis(5));
    }

    #[test]
    fn unregistered_configs_read_their_default() {
        let configs = ConfigSet::default();
        assert_eq!(USIZE.get(&configs), 1);
        assert!(!USIZE.set(&configs, 2));
    }

    #[test]
    fn sets_are_independent() {
        let c0 = ConfigSet::default().add(&USIZE);
        let c1 = c0.clone();
        // Clones share values; fresh sets do not.
        USIZE.set(&c0, 2);
        assert_eq!(USIZE.get(&c1), 2);
        let c2 = ConfigSet::default().add(&USIZE);
        assert_eq!(USIZE.get(&c2), 1);

        let mut updates = ConfigUpdates::default();
        for e in c0.entries() {
            updates.add(e);
        }
        updates.apply(&c2).unwrap();
        assert_eq!(USIZE.get(&c2), 2);
    }

    #[test]
    fn updates_parse_strings() {
        let configs = all_configs(ConfigSet::default());
        let mut updates = ConfigUpdates::default();
        updates.add_str("cutover_lock_timeout", "250ms");
        updates.add_str("backfill_reconciliation_retries", "3");
        updates.apply(&configs).unwrap();
        assert_eq!(
            CUTOVER_LOCK_TIMEOUT.get(&configs),
            Duration::from_millis(250)
        );
        assert_eq!(BACKFILL_RECONCILIATION_RETRIES.get(&configs), 3);
    }

    #[test]
    fn bad_update_changes_nothing() {
        let configs = all_configs(ConfigSet::default());
        let mut updates = ConfigUpdates::default();
        updates.add_str("backfill_batch_size", "10");
        updates.add_str("verify_sample_size", "lots");
        assert!(matches!(
            updates.apply(&configs),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(BACKFILL_BATCH_SIZE.get(&configs), 1_000);

        let mut updates = ConfigUpdates::default();
        updates.add_str("no_such_config", "1");
        assert_eq!(
            updates.apply(&configs),
            Err(ConfigError::Unknown("no_such_config".into()))
        );
    }
}
