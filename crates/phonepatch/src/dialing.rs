//! Turning keypad input into a call target.

use phonepatch_core::dtmf::symbols_to_string;
use phonepatch_core::DtmfSymbol;

use crate::config::{Config, Extension, OutcallTrigger};

/// Drop noisy-button presses and merge the repeats they separate.
///
/// On a noisy channel one key press can decode as the same digit twice.
/// Digits equal to their predecessor, with only noisy presses in between,
/// count once.
pub fn collapse_noisy(keys: &[DtmfSymbol], noisy: DtmfSymbol) -> Vec<DtmfSymbol> {
    let mut out: Vec<DtmfSymbol> = Vec::with_capacity(keys.len());
    for &key in keys.iter().filter(|&&k| k != noisy) {
        if out.last() != Some(&key) {
            out.push(key);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialProgress {
    Collecting,
    /// Everything collected so far was discarded.
    Cleared,
    /// The outcall key ended dialing; the number may be empty.
    Complete(String),
}

/// Accumulates keys between the dial tone and the outcall key.
#[derive(Debug, Clone)]
pub struct DialCollector {
    clear: Option<DtmfSymbol>,
    outcall: DtmfSymbol,
    noisy: Option<DtmfSymbol>,
    keys: Vec<DtmfSymbol>,
}

impl DialCollector {
    pub fn new(clear: Option<DtmfSymbol>, outcall: DtmfSymbol, noisy: Option<DtmfSymbol>) -> Self {
        DialCollector {
            clear,
            outcall,
            noisy,
            keys: Vec::new(),
        }
    }

    pub fn push(&mut self, key: DtmfSymbol) -> DialProgress {
        if Some(key) == self.clear {
            self.keys.clear();
            return DialProgress::Cleared;
        }
        if key == self.outcall {
            let keys = std::mem::take(&mut self.keys);
            let digits = match self.noisy {
                Some(noisy) => collapse_noisy(&keys, noisy),
                None => keys,
            };
            return DialProgress::Complete(symbols_to_string(&digits));
        }
        self.keys.push(key);
        DialProgress::Collecting
    }
}

/// Who an outcall is for and what to ask the PBX for.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub extension: Extension,
    /// The `Extension:` line of the spool entry.
    pub pbx_extension: String,
    /// What the PBX dials (`%x` of the channel).
    pub number: String,
}

/// Work out the target of a dialed `number`.
///
/// A `preset` extension (CTCSS trigger) is used as is. Otherwise, in DTMF
/// extension mode the number must start with the `dtmf_id` of one of the
/// DTMF-triggered extensions, which is stripped; the longest matching
/// prefix wins. Without that mode the first DTMF-triggered extension takes
/// the call, or the station itself when there is none.
pub fn resolve_dial(config: &Config, preset: Option<&Extension>, number: &str) -> Option<DialTarget> {
    let outcall = &config.outcall;
    let (extension, number) = match preset {
        Some(ext) => (ext.clone(), number.to_owned()),
        None if outcall.dtmf_extension_mode => {
            let (ext, rest) = config
                .extensions
                .iter()
                .filter(|e| e.outcall_trigger == OutcallTrigger::Dtmf && e.outcall_enabled)
                .filter_map(|e| {
                    let prefix = e.dtmf_prefix()?;
                    number.strip_prefix(prefix.as_str()).map(|rest| (e, prefix.len(), rest))
                })
                .max_by_key(|&(_, len, _)| len)
                .map(|(e, _, rest)| (e, rest))?;
            (ext.clone(), rest.to_owned())
        }
        None => {
            let ext = config
                .extensions
                .iter()
                .find(|e| e.outcall_trigger == OutcallTrigger::Dtmf && e.outcall_enabled)
                .cloned()
                .unwrap_or_else(|| Extension {
                    id: config.station.name.clone(),
                    ..Extension::default()
                });
            (ext, number.to_owned())
        }
    };
    if number.is_empty() {
        return None;
    }
    Some(DialTarget {
        pbx_extension: outcall.extension.replace("%x", &extension.id),
        extension,
        number,
    })
}
