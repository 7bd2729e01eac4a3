//! Daemon configuration.
//!
//! One TOML file per radio channel, loaded once at startup, validated,
//! then shared read-only as `Arc<Config>`. Every section has defaults, so
//! an empty file is a valid (if not very useful) configuration. Times are
//! fractional seconds.
//!
//! ```toml
//! [station]
//! name = "vhf"
//!
//! [radio]
//! mode = "serial"
//! device = "/dev/ttyS0"
//! lines = ["rts", "-dcd", ""]
//!
//! [[extension]]
//! id = "200"
//! outcall_trigger = "ctcss"
//! ctcss_rx = "1Z"
//! autodial = "5551234"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use phonepatch_core::ctcss::lookup_frequency;
use phonepatch_core::{CtcssEncoder, DtmfSymbol, PcmFormat, SampleFormat};
use phonepatch_transport::{CommandOptions, RadioSpec};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Seconds from configuration to a [`Duration`]. Negative means zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub station: StationConfig,
    pub audio: AudioConfig,
    pub radio: RadioConfig,
    pub ptt: PttConfig,
    pub carrier: CarrierConfig,
    pub dtmf: DtmfConfig,
    pub ctcss: CtcssConfig,
    pub telephony: TelephonyConfig,
    pub prompts: PromptConfig,
    pub outcall: OutcallConfig,
    #[serde(rename = "extension")]
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationConfig {
    pub name: String,
    pub username: String,
    pub language: String,
    pub sounds_dir: PathBuf,
    pub spool_dir: PathBuf,
    /// Pidfile and control socket.
    pub run_dir: PathBuf,
    /// Bytes moved per read on the audio paths.
    pub buffer_size: usize,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            name: "phonepatch".into(),
            username: "phonepatch".into(),
            language: "en".into(),
            sounds_dir: PathBuf::from("/usr/share/phonepatch/sounds"),
            spool_dir: PathBuf::from("/var/spool/asterisk/outgoing"),
            run_dir: PathBuf::from("/var/run/phonepatch"),
            buffer_size: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Oss,
    Cpal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub backend: AudioBackend,
    pub device: String,
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    /// Zero keeps the driver default.
    pub fragment_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            backend: AudioBackend::Oss,
            device: "/dev/dsp".into(),
            sample_format: SampleFormat::S16Le,
            sample_rate: 8000,
            channels: 1,
            fragment_size: 0,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> Result<PcmFormat> {
        PcmFormat::new(self.sample_format, self.channels, self.sample_rate)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioMode {
    Serial,
    Parallel,
    Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadioConfig {
    pub mode: RadioMode,
    /// Port path, or the shell command in command mode.
    pub device: String,
    /// ptt, carrier, power. Empty list selects the transport defaults.
    pub lines: Vec<String>,
    pub on_open_wait: f64,
    pub ptt_on: String,
    pub ptt_off: String,
    pub carrier_query: String,
    pub carrier_pattern: String,
    pub carrier_timeout: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        let options = CommandOptions::default();
        RadioConfig {
            mode: RadioMode::Serial,
            device: "/dev/ttyS0".into(),
            lines: Vec::new(),
            on_open_wait: 0.05,
            ptt_on: options.ptt_on,
            ptt_off: options.ptt_off,
            carrier_query: options.carrier_query,
            carrier_pattern: options.carrier_pattern,
            carrier_timeout: 0.5,
        }
    }
}

impl RadioConfig {
    pub fn spec(&self) -> RadioSpec {
        match self.mode {
            RadioMode::Serial => RadioSpec::Serial {
                device: self.device.clone(),
                lines: self.lines.clone(),
                on_open_wait: secs(self.on_open_wait),
            },
            RadioMode::Parallel => RadioSpec::Parallel {
                device: self.device.clone(),
                lines: self.lines.clone(),
                on_open_wait: secs(self.on_open_wait),
            },
            RadioMode::Command => RadioSpec::Command {
                command: self.device.clone(),
                options: CommandOptions {
                    ptt_on: self.ptt_on.clone(),
                    ptt_off: self.ptt_off.clone(),
                    carrier_query: self.carrier_query.clone(),
                    carrier_pattern: self.carrier_pattern.clone(),
                },
            },
        }
    }
}

/// VOX gate keying the radio from telephony audio.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PttConfig {
    /// Peak level that keys the transmitter.
    pub threshold: f32,
    pub tail_time: f64,
    /// Longest continuous keying; zero for no limit.
    pub max_time: f64,
    /// Forced rest after `max_time`.
    pub wait_time: f64,
    /// Delay between keying and the first audio of a prompt.
    pub txdelay: f64,
}

impl Default for PttConfig {
    fn default() -> Self {
        PttConfig {
            threshold: 0.02,
            tail_time: 0.5,
            max_time: 0.0,
            wait_time: 2.0,
            txdelay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierMode {
    Off,
    Line,
    Audio,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarrierConfig {
    pub mode: CarrierMode,
    pub threshold: f32,
    pub tail_time: f64,
    pub polling_time: f64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        CarrierConfig {
            mode: CarrierMode::Off,
            threshold: 0.02,
            tail_time: 0.5,
            polling_time: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DtmfConfig {
    pub sensitivity: f32,
    /// Unset disables DTMF triggering from idle.
    pub askfortone_button: Option<DtmfSymbol>,
    pub noisy_button: Option<DtmfSymbol>,
    pub answer_button: DtmfSymbol,
    pub hangup_button: Option<DtmfSymbol>,
    pub clear_button: Option<DtmfSymbol>,
    pub outcall_button: DtmfSymbol,
    /// Time allowed to dial after the tone prompt.
    pub tone_timeout: f64,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        DtmfConfig {
            sensitivity: 1.0,
            askfortone_button: Some(DtmfSymbol::Star),
            noisy_button: None,
            answer_button: DtmfSymbol::Hash,
            hangup_button: Some(DtmfSymbol::Hash),
            clear_button: Some(DtmfSymbol::Star),
            outcall_button: DtmfSymbol::Hash,
            tone_timeout: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CtcssConfig {
    pub min_lock_time: f64,
    /// Fraction of block power the tone must carry.
    pub threshold: f32,
}

impl Default for CtcssConfig {
    fn default() -> Self {
        CtcssConfig {
            min_lock_time: 0.5,
            threshold: phonepatch_core::ctcss::DEFAULT_DETECTOR_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelephonyConfig {
    /// Gain applied to telephony audio sent to the radio.
    pub radio_gain: f32,
    /// Gain applied to radio audio sent to the telephony peer.
    pub telephony_gain: f32,
    /// Ceiling on radio audio before gain.
    pub radio_level_limit: f32,
    pub call_limit: Option<f64>,
    pub peer_timeout: f64,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        TelephonyConfig {
            radio_gain: 1.0,
            telephony_gain: 1.0,
            radio_level_limit: 1.0,
            call_limit: None,
            peer_timeout: 2.0,
        }
    }
}

/// Prompt texts: comma separated sound files and `@text` items.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptConfig {
    /// Reads text on stdin, writes raw PCM on stdout.
    pub tts_command: Option<String>,
    /// `{file}` and `{rate}` are substituted; writes raw PCM on stdout.
    pub convert_command: Option<String>,
    pub tone: String,
    /// Longest the tone prompt loops.
    pub tone_time: f64,
    pub tone_timeout: String,
    pub ring: String,
    pub ring_timeout: String,
    pub incall_report: String,
    pub incall_timeout: String,
    pub end: String,
    pub pbx_inactive: String,
    pub outcall_refused: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            tts_command: None,
            convert_command: Some(
                "sox {file} -t raw -r {rate} -c 1 -e signed-integer -b 16 -L -".into(),
            ),
            tone: "tone.wav".into(),
            tone_time: 3.0,
            tone_timeout: "@Dial timeout".into(),
            ring: "ring.wav".into(),
            ring_timeout: "@No answer".into(),
            incall_report: "@Incoming call for %u".into(),
            incall_timeout: "@Call not answered".into(),
            end: "@Call ended".into(),
            pbx_inactive: "@Telephony server not available".into(),
            outcall_refused: "@Call not allowed".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutcallConfig {
    pub enabled: bool,
    /// `%x` is the dialed number.
    pub channel: String,
    pub context: String,
    /// `%x` is the extension id.
    pub extension: String,
    pub timeout: u32,
    pub priority: u32,
    pub callerid: Option<String>,
    /// Dialed numbers start with an extension's `dtmf_id`.
    pub dtmf_extension_mode: bool,
    /// Non-zero exit means the PBX is down.
    pub pbx_check_command: Option<String>,
    /// `%x` is the dialed number; non-zero exit refuses the call.
    pub check_script: Option<String>,
    /// Longest a single ring prompt plays.
    pub ring_time: f64,
    /// Pause between ring prompts.
    pub ring_wait: f64,
}

impl Default for OutcallConfig {
    fn default() -> Self {
        OutcallConfig {
            enabled: true,
            channel: "SIP/%x".into(),
            context: "phonepatch".into(),
            extension: "%x".into(),
            timeout: 30,
            priority: 1,
            callerid: None,
            dtmf_extension_mode: false,
            pbx_check_command: None,
            check_script: None,
            ring_time: 5.0,
            ring_wait: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcallTrigger {
    Dtmf,
    Ctcss,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    Open,
    Dtmf,
    Ctcss,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionPrompts {
    pub incall_report: Option<String>,
    pub incall_timeout: Option<String>,
    pub end: Option<String>,
}

/// A logical radio user sharing the channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Extension {
    pub id: String,
    pub username: Option<String>,
    pub outcall_trigger: OutcallTrigger,
    pub incall_answer: AnswerMode,
    pub ctcss_rx: Option<String>,
    pub ctcss_tx: Option<String>,
    pub ctcss_tx_amplitude: f32,
    /// Dial prefix selecting this extension; `%x` is the id.
    pub dtmf_id: Option<String>,
    /// Number dialed as soon as `ctcss_rx` is heard.
    pub autodial: Option<String>,
    pub incall_enabled: bool,
    pub outcall_enabled: bool,
    pub answer: Option<DtmfSymbol>,
    pub hangup: Option<DtmfSymbol>,
    pub clear: Option<DtmfSymbol>,
    pub outcall: Option<DtmfSymbol>,
    pub incall_report_wait: f64,
    pub incall_report_timeout: f64,
    pub prompts: ExtensionPrompts,
}

impl Default for Extension {
    fn default() -> Self {
        Extension {
            id: String::new(),
            username: None,
            outcall_trigger: OutcallTrigger::Dtmf,
            incall_answer: AnswerMode::Dtmf,
            ctcss_rx: None,
            ctcss_tx: None,
            ctcss_tx_amplitude: 0.15,
            dtmf_id: None,
            autodial: None,
            incall_enabled: true,
            outcall_enabled: true,
            answer: None,
            hangup: None,
            clear: None,
            outcall: None,
            incall_report_wait: 5.0,
            incall_report_timeout: 30.0,
            prompts: ExtensionPrompts::default(),
        }
    }
}

impl Extension {
    pub fn username<'a>(&'a self, station: &'a StationConfig) -> &'a str {
        self.username.as_deref().unwrap_or(&station.username)
    }

    /// Receive tone in Hz. Validated at load time.
    pub fn ctcss_rx_frequency(&self) -> Option<f32> {
        self.ctcss_rx
            .as_deref()
            .and_then(|id| lookup_frequency(id).ok().flatten())
    }

    /// Transmit tone mixer for this extension, if it has a tone.
    pub fn ctcss_encoder(&self) -> Option<CtcssEncoder> {
        let freq = self
            .ctcss_tx
            .as_deref()
            .and_then(|id| lookup_frequency(id).ok().flatten())?;
        (self.ctcss_tx_amplitude > 0.0).then(|| CtcssEncoder::new(freq, self.ctcss_tx_amplitude))
    }

    pub fn dtmf_prefix(&self) -> Option<String> {
        self.dtmf_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| p.replace("%x", &self.id))
    }

    pub fn answer_button(&self, dtmf: &DtmfConfig) -> DtmfSymbol {
        self.answer.unwrap_or(dtmf.answer_button)
    }

    pub fn hangup_button(&self, dtmf: &DtmfConfig) -> Option<DtmfSymbol> {
        self.hangup.or(dtmf.hangup_button)
    }

    pub fn clear_button(&self, dtmf: &DtmfConfig) -> Option<DtmfSymbol> {
        self.clear.or(dtmf.clear_button)
    }

    pub fn outcall_button(&self, dtmf: &DtmfConfig) -> DtmfSymbol {
        self.outcall.unwrap_or(dtmf.outcall_button)
    }

    pub fn incall_report_prompt<'a>(&'a self, prompts: &'a PromptConfig) -> &'a str {
        self.prompts
            .incall_report
            .as_deref()
            .unwrap_or(&prompts.incall_report)
    }

    pub fn incall_timeout_prompt<'a>(&'a self, prompts: &'a PromptConfig) -> &'a str {
        self.prompts
            .incall_timeout
            .as_deref()
            .unwrap_or(&prompts.incall_timeout)
    }

    pub fn end_prompt<'a>(&'a self, prompts: &'a PromptConfig) -> &'a str {
        self.prompts.end.as_deref().unwrap_or(&prompts.end)
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config = Config::parse(&text)?;
        tracing::debug!(path = %path.display(), extensions = config.extensions.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pcm_format(&self) -> Result<PcmFormat> {
        self.audio.format()
    }

    pub fn extension(&self, id: &str) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let format = self.audio.format()?;
        if self.station.buffer_size < format.frame_bytes() {
            return Err(Error::Config(format!(
                "buffer_size {} is smaller than one frame",
                self.station.buffer_size
            )));
        }
        if self.station.name.is_empty() || self.station.name.contains('/') {
            return Err(Error::Config(format!(
                "invalid station name: {:?}",
                self.station.name
            )));
        }
        if self.radio.mode == RadioMode::Command && self.radio.device.trim().is_empty() {
            return Err(Error::Config("command radio mode needs a command".into()));
        }
        if self.dtmf.sensitivity.is_nan() || self.dtmf.sensitivity <= 0.0 {
            return Err(Error::Config("dtmf sensitivity must be positive".into()));
        }
        if self.telephony.peer_timeout <= 0.0 {
            return Err(Error::Config("peer_timeout must be positive".into()));
        }

        let mut ids = HashSet::new();
        for ext in &self.extensions {
            if ext.id.is_empty() {
                return Err(Error::Config("extension without id".into()));
            }
            if !ids.insert(ext.id.as_str()) {
                return Err(Error::Config(format!("duplicate extension id: {}", ext.id)));
            }
            for tone in [&ext.ctcss_rx, &ext.ctcss_tx].into_iter().flatten() {
                lookup_frequency(tone)
                    .map_err(|e| Error::Config(format!("extension {}: {e}", ext.id)))?;
            }
            let has_rx = ext.ctcss_rx_frequency().is_some();
            if ext.outcall_trigger == OutcallTrigger::Ctcss && !has_rx {
                return Err(Error::Config(format!(
                    "extension {}: ctcss trigger needs ctcss_rx",
                    ext.id
                )));
            }
            if ext.incall_answer == AnswerMode::Ctcss && !has_rx {
                return Err(Error::Config(format!(
                    "extension {}: ctcss answer mode needs ctcss_rx",
                    ext.id
                )));
            }
            if let Some(number) = &ext.autodial {
                if ext.outcall_trigger != OutcallTrigger::Ctcss {
                    return Err(Error::Config(format!(
                        "extension {}: autodial needs the ctcss trigger",
                        ext.id
                    )));
                }
                DtmfSymbol::parse_sequence(number)
                    .map_err(|e| Error::Config(format!("extension {}: autodial: {e}", ext.id)))?;
            }
        }
        Ok(())
    }
}
