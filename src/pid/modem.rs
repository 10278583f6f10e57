//! Modems attached to a modem node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{ModemConfig, PidConfig};
use crate::constants::{delivery_result, SMS_SEGMENT_ASCII, SMS_SEGMENT_UNICODE};
use crate::error::AppError;
use crate::types::{Message, ModemRegistration};

#[async_trait]
pub trait Modem: Send + Sync {
    /// Bring the modem into a state where it can send, entering the PIN if
    /// one is needed.
    async fn initialize(&self) -> Result<(), AppError>;
    async fn send(&self, content: &str, number: &str) -> Result<(), AppError>;
}

/// Content that does not fit a single segment for its alphabet.
pub fn needs_long_form(content: &str) -> bool {
    let chars = content.chars().count();
    if content.is_ascii() {
        chars > SMS_SEGMENT_ASCII
    } else {
        chars > SMS_SEGMENT_UNICODE
    }
}

/// `+436601234` with exit code `00` becomes `00436601234`.
pub fn dial_number(exit_code: &str, number: &str) -> String {
    format!("{}{}", exit_code, number.trim_start_matches('+'))
}

/// Modem driven through the `gammu` command line tool.
pub struct GammuModem {
    command: String,
    base_args: Vec<String>,
    pin: Option<String>,
    exit_code: String,
}

const PIN_SETTLE: Duration = Duration::from_secs(5);

impl GammuModem {
    pub fn new(command: &str, gammu_config: &str, modem: &ModemConfig) -> Self {
        let mut base_args = Vec::new();
        if !gammu_config.is_empty() {
            base_args.push("-c".to_string());
            base_args.push(gammu_config.to_string());
        }
        base_args.push("-s".to_string());
        base_args.push(modem.gammu_section.to_string());

        Self {
            command: command.to_string(),
            base_args,
            pin: modem.pin.clone(),
            exit_code: modem.country_exit_code.clone(),
        }
    }

    pub fn send_args(&self, content: &str, number: &str) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("sendsms".to_string());
        args.push("TEXT".to_string());
        args.push(dial_number(&self.exit_code, number));
        if !content.is_ascii() {
            args.push("-unicode".to_string());
        }
        if needs_long_form(content) {
            args.push("-autolen".to_string());
            args.push(content.chars().count().to_string());
        }
        args.push("-text".to_string());
        args.push(content.to_string());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, AppError> {
        let output = Command::new(&self.command)
            .args(args)
            .env("LANG", "en_US.UTF-8")
            .output()
            .await
            .map_err(|e| AppError::Modem(format!("failed to run {}: {}", self.command, e)))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn unlocked(&self) -> Result<bool, AppError> {
        let mut args = self.base_args.clone();
        args.push("getsecuritystatus".to_string());
        let output = self.run(&args).await?;
        Ok(output.contains("Nothing to enter."))
    }
}

#[async_trait]
impl Modem for GammuModem {
    async fn initialize(&self) -> Result<(), AppError> {
        if self.unlocked().await? {
            return Ok(());
        }
        let Some(pin) = &self.pin else {
            return Err(AppError::Modem("modem is locked and no PIN is configured".to_string()));
        };

        let mut args = self.base_args.clone();
        args.extend(["entersecuritycode".to_string(), "PIN".to_string(), pin.clone()]);
        self.run(&args).await?;
        tokio::time::sleep(PIN_SETTLE).await;

        if self.unlocked().await? {
            Ok(())
        } else {
            Err(AppError::Modem("modem still locked after entering PIN".to_string()))
        }
    }

    async fn send(&self, content: &str, number: &str) -> Result<(), AppError> {
        let output = self.run(&self.send_args(content, number)).await?;
        tracing::debug!("gammu sendsms output: {}", output.trim());
        if output.contains("Error") || output.contains("Failed") || output.contains("error") {
            return Err(AppError::Modem(output.trim().to_string()));
        }
        Ok(())
    }
}

/// Stand-in modem for test deployments. The content selects the outcome:
/// `SUCCESS` and `ERROR` answer after a short pause, `LONGWAIT` succeeds
/// only after longer than any dispatcher waits, anything else succeeds.
pub struct TestModem {
    short_wait: Duration,
    long_wait: Duration,
}

impl TestModem {
    pub fn new() -> Self {
        Self::with_waits(Duration::from_secs(2), Duration::from_secs(130))
    }

    pub fn with_waits(short_wait: Duration, long_wait: Duration) -> Self {
        Self {
            short_wait,
            long_wait,
        }
    }
}

impl Default for TestModem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Modem for TestModem {
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn send(&self, content: &str, _number: &str) -> Result<(), AppError> {
        match content {
            "SUCCESS" => {
                tokio::time::sleep(self.short_wait).await;
                Ok(())
            }
            "ERROR" => {
                tokio::time::sleep(self.short_wait).await;
                Err(AppError::Modem("test modem asked to fail".to_string()))
            }
            "LONGWAIT" => {
                tokio::time::sleep(self.long_wait).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct BankEntry {
    registration: ModemRegistration,
    modem: Arc<dyn Modem>,
    // one send at a time per device
    busy: tokio::sync::Mutex<()>,
}

/// The usable modems of a node, keyed by modem id.
#[derive(Default)]
pub struct ModemBank {
    entries: Vec<BankEntry>,
}

impl ModemBank {
    /// Build and initialize every configured modem; modems that fail to
    /// initialize are left out.
    pub async fn connect(config: &PidConfig) -> Self {
        let mut bank = Self::default();
        for modem_config in &config.modems {
            let modem: Arc<dyn Modem> = if config.test_mode {
                Arc::new(TestModem::new())
            } else {
                Arc::new(GammuModem::new(
                    &config.gammu_command,
                    &config.gammu_config,
                    modem_config,
                ))
            };
            bank.add(registration(modem_config), modem).await;
        }
        bank
    }

    pub async fn add(&mut self, registration: ModemRegistration, modem: Arc<dyn Modem>) {
        match modem.initialize().await {
            Ok(()) => {
                tracing::info!("📶 Modem {} ready", registration.modem_id);
                self.entries.push(BankEntry {
                    registration,
                    modem,
                    busy: tokio::sync::Mutex::new(()),
                });
            }
            Err(e) => tracing::warn!(
                "⚠️  Modem {} dropped, initialization failed: {}",
                registration.modem_id,
                e
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn registrations(&self) -> Vec<ModemRegistration> {
        self.entries.iter().map(|e| e.registration.clone()).collect()
    }

    /// Send `sms` on its modem and return the session status value.
    pub async fn send(&self, sms: &Message) -> &'static str {
        let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.registration.modem_id == sms.modem_id)
        else {
            tracing::warn!("⚠️  No modem {} on this node for message {}", sms.modem_id, sms.id);
            return delivery_result::ERROR;
        };

        let _busy = entry.busy.lock().await;
        match entry.modem.send(&sms.content, &sms.target_number).await {
            Ok(()) => delivery_result::SUCCESS,
            Err(e) => {
                tracing::error!("❌ Sending {} via {} failed: {}", sms.id, sms.modem_id, e);
                delivery_result::ERROR
            }
        }
    }
}

fn registration(modem: &ModemConfig) -> ModemRegistration {
    ModemRegistration {
        modem_id: modem.modem_id.clone(),
        number_pattern: modem.number_pattern.clone(),
        label: modem.label.clone(),
        load_factor: modem.load_factor,
        delivery_url: String::new(),
        route_id: String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
