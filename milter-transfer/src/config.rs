use std::time::Duration;

use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use milter::{EngineConfig, RejectionGranularity, ReplyMode};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Cfg {
    #[serde(default)]
    pub log: CfgLog,
    #[serde(default)]
    pub engine: CfgEngine,
    #[serde(default)]
    pub transfer: CfgTransfer,
}

#[derive(Debug, Deserialize)]
pub struct CfgLog {
    pub level: String,
    pub json: bool,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CfgReplyMode {
    Immediate,
    #[default]
    Deferred,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CfgGranularity {
    WholeMessage,
    #[default]
    PerRecipient,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CfgEngine {
    pub reply_mode: CfgReplyMode,
    pub accept_modifications_on_reject: bool,
    pub recipient_rejection_granularity: CfgGranularity,
    pub local_host: String,
    /// Per-callback timeout in seconds; unset means no timeout.
    pub callback_timeout_secs: Option<u64>,
}

impl Default for CfgEngine {
    fn default() -> Self {
        CfgEngine {
            reply_mode: CfgReplyMode::default(),
            accept_modifications_on_reject: false,
            recipient_rejection_granularity: CfgGranularity::default(),
            local_host: "localhost".to_string(),
            callback_timeout_secs: None,
        }
    }
}

impl CfgEngine {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            reply_mode: match self.reply_mode {
                CfgReplyMode::Immediate => ReplyMode::Immediate,
                CfgReplyMode::Deferred => ReplyMode::Deferred,
            },
            accept_modifications_on_reject: self.accept_modifications_on_reject,
            recipient_rejection_granularity: match self.recipient_rejection_granularity {
                CfgGranularity::WholeMessage => RejectionGranularity::WholeMessage,
                CfgGranularity::PerRecipient => RejectionGranularity::PerRecipient,
            },
            local_host: self.local_host.clone(),
            callback_timeout: self.callback_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CfgTransfer {
    /// Addresses that get a copy of any message flagged as an emergency,
    /// in configured order.
    pub emergency_addresses: Vec<String>,
}

impl Default for CfgTransfer {
    fn default() -> Self {
        CfgTransfer {
            emergency_addresses: vec![
                "emergency@example.com".to_string(),
                "root@example.com".to_string(),
            ],
        }
    }
}

impl Cfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }
}
