// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{ErrorKind::IllegalArgument, Result};

/// Denotes a flush trigger is disabled.
pub const DISABLE_AUTO_FLUSH: i32 = -1;

/// Disabled by default (because the writer flushes by RAM usage by default).
pub const DEFAULT_MAX_BUFFERED_DELETE_TERMS: i32 = DISABLE_AUTO_FLUSH;

/// Disabled by default (because the writer flushes by RAM usage by default).
pub const DEFAULT_MAX_BUFFERED_DOCS: i32 = DISABLE_AUTO_FLUSH;

/// Default value is 16 MB (which means flush when buffered docs consume
/// approximately 16 MB RAM.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Hard ceiling for a single `DocumentsWriterPerThread`, independent of the
/// RAM buffer. A writer above it is forced pending.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 1945;

/// Upper bound of `DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB`, a writer can not
/// address more than 2048 MB.
pub const MAX_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 2048;

/// Default number of concurrently indexing `ThreadState`s.
pub const DEFAULT_MAX_THREAD_STATES: usize = 8;

/// Holds all the configuration used by the `DocumentsWriter` and its
/// `DocumentsWriterFlushControl`.
///
/// `None` for one of the optional triggers means the trigger is disabled,
/// the same as setting it to `DISABLE_AUTO_FLUSH` through the setters.
///
/// The config can be built in code:
///
/// ```rust
/// use flush_control::core::index::writer::IndexWriterConfig;
///
/// let mut config = IndexWriterConfig::default();
/// config.set_ram_buffer_size_mb(64.0).unwrap();
/// config.set_max_buffered_docs(10_000).unwrap();
/// ```
///
/// or loaded from JSON, missing keys keep their defaults:
///
/// ```rust
/// use flush_control::core::index::writer::IndexWriterConfig;
///
/// let config = IndexWriterConfig::from_json(r#"{"ram_buffer_size_mb": 32.0}"#).unwrap();
/// assert!(config.flush_on_ram());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_docs: Option<u32>,
    pub max_buffered_delete_terms: Option<u32>,
    pub per_thread_hard_limit_mb: u32,
    pub max_thread_states: usize,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            max_thread_states: DEFAULT_MAX_THREAD_STATES,
        }
    }
}

impl IndexWriterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: IndexWriterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) || !mb.is_finite() {
                bail!(IllegalArgument(format!(
                    "ram_buffer_size_mb must be > 0 when enabled, got {}",
                    mb
                )));
            }
        }
        if self.max_buffered_docs == Some(0) {
            bail!(IllegalArgument(
                "max_buffered_docs must be at least 1 when enabled".into()
            ));
        }
        if self.max_buffered_delete_terms == Some(0) {
            bail!(IllegalArgument(
                "max_buffered_delete_terms must be at least 1 when enabled".into()
            ));
        }
        if self.per_thread_hard_limit_mb == 0
            || self.per_thread_hard_limit_mb >= MAX_RAM_PER_THREAD_HARD_LIMIT_MB
        {
            bail!(IllegalArgument(format!(
                "per_thread_hard_limit_mb must be greater than 0 and less than {}, got {}",
                MAX_RAM_PER_THREAD_HARD_LIMIT_MB, self.per_thread_hard_limit_mb
            )));
        }
        if self.max_thread_states == 0 {
            bail!(IllegalArgument(
                "max_thread_states must be at least 1".into()
            ));
        }
        Ok(())
    }

    /// Sets the RAM buffer in MB, or disables flushing by RAM with
    /// `DISABLE_AUTO_FLUSH`.
    pub fn set_ram_buffer_size_mb(&mut self, mb: f64) -> Result<&mut Self> {
        if mb == DISABLE_AUTO_FLUSH as f64 {
            self.ram_buffer_size_mb = None;
        } else if mb > 0.0 && mb.is_finite() {
            self.ram_buffer_size_mb = Some(mb);
        } else {
            bail!(IllegalArgument(
                "ram_buffer_size_mb should be a finite value > 0.0 MB when enabled".into()
            ));
        }
        Ok(self)
    }

    pub fn set_max_buffered_docs(&mut self, max_buffered_docs: i32) -> Result<&mut Self> {
        self.max_buffered_docs = Self::trigger_value("max_buffered_docs", max_buffered_docs)?;
        Ok(self)
    }

    pub fn set_max_buffered_delete_terms(&mut self, max_terms: i32) -> Result<&mut Self> {
        self.max_buffered_delete_terms =
            Self::trigger_value("max_buffered_delete_terms", max_terms)?;
        Ok(self)
    }

    pub fn set_per_thread_hard_limit_mb(&mut self, mb: u32) -> Result<&mut Self> {
        if mb == 0 || mb >= MAX_RAM_PER_THREAD_HARD_LIMIT_MB {
            bail!(IllegalArgument(format!(
                "per_thread_hard_limit_mb must be greater than 0 and less than {}",
                MAX_RAM_PER_THREAD_HARD_LIMIT_MB
            )));
        }
        self.per_thread_hard_limit_mb = mb;
        Ok(self)
    }

    pub fn set_max_thread_states(&mut self, max_thread_states: usize) -> Result<&mut Self> {
        if max_thread_states == 0 {
            bail!(IllegalArgument(
                "max_thread_states must be at least 1".into()
            ));
        }
        self.max_thread_states = max_thread_states;
        Ok(self)
    }

    fn trigger_value(name: &str, value: i32) -> Result<Option<u32>> {
        if value == DISABLE_AUTO_FLUSH {
            Ok(None)
        } else if value > 0 {
            Ok(Some(value as u32))
        } else {
            bail!(IllegalArgument(format!(
                "{} must be at least 1 when enabled",
                name
            )))
        }
    }

    pub fn ram_buffer_size_mb(&self) -> f64 {
        let res = self.ram_buffer_size_mb.unwrap_or(0.0);
        debug_assert!(res >= 0.0);
        res
    }

    pub fn ram_buffer_size(&self) -> u64 {
        debug_assert!(self.ram_buffer_size_mb.is_some());
        (self.ram_buffer_size_mb() * 1024.0 * 1024.0) as u64
    }

    pub fn max_buffered_delete_terms(&self) -> u32 {
        self.max_buffered_delete_terms.unwrap_or(0)
    }

    pub fn max_buffered_docs(&self) -> u32 {
        self.max_buffered_docs.unwrap_or(0)
    }

    pub fn flush_on_delete_terms(&self) -> bool {
        self.max_buffered_delete_terms.is_some()
    }

    pub fn flush_on_ram(&self) -> bool {
        self.ram_buffer_size_mb.is_some()
    }

    pub fn flush_on_doc_count(&self) -> bool {
        self.max_buffered_docs.is_some()
    }

    pub fn per_thread_hard_limit(&self) -> u64 {
        self.per_thread_hard_limit_mb as u64 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IndexWriterConfig::default();
        assert!(config.flush_on_ram());
        assert!(!config.flush_on_doc_count());
        assert!(!config.flush_on_delete_terms());
        assert_eq!(config.ram_buffer_size(), 16 * 1024 * 1024);
        assert_eq!(config.per_thread_hard_limit(), 1945 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disable_auto_flush() {
        let mut config = IndexWriterConfig::default();
        config
            .set_ram_buffer_size_mb(DISABLE_AUTO_FLUSH as f64)
            .unwrap()
            .set_max_buffered_docs(DISABLE_AUTO_FLUSH)
            .unwrap();
        assert!(!config.flush_on_ram());
        assert!(!config.flush_on_doc_count());

        config.set_max_buffered_docs(100).unwrap();
        assert_eq!(config.max_buffered_docs(), 100);
        assert!(config.set_max_buffered_docs(0).is_err());
        assert!(config.set_ram_buffer_size_mb(-2.0).is_err());
        assert!(config.set_ram_buffer_size_mb(std::f64::INFINITY).is_err());
        assert!(config.set_ram_buffer_size_mb(std::f64::NAN).is_err());
        assert!(config.set_per_thread_hard_limit_mb(2048).is_err());
        assert!(config.set_max_thread_states(0).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config = IndexWriterConfig::from_json(
            r#"{"ram_buffer_size_mb": null, "max_buffered_docs": 1000, "per_thread_hard_limit_mb": 64}"#,
        )
        .unwrap();
        assert!(!config.flush_on_ram());
        assert_eq!(config.max_buffered_docs(), 1000);
        assert_eq!(config.per_thread_hard_limit(), 64 * 1024 * 1024);
        assert_eq!(config.max_thread_states, DEFAULT_MAX_THREAD_STATES);

        assert!(IndexWriterConfig::from_json(r#"{"per_thread_hard_limit_mb": 4096}"#).is_err());
        assert!(IndexWriterConfig::from_json("{not json").is_err());

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(IndexWriterConfig::from_json(&json).unwrap(), config);
    }
}
