//! Prompt rendering.
//!
//! A prompt is a comma separated list of items. An item starting with `@`
//! is text for the speech synthesizer; anything else names a sound file,
//! looked up under the station language first. `%u` expands to the user
//! the prompt is addressed to.
//!
//! Both helpers are expected to write 16-bit little-endian mono PCM at the
//! station sample rate; the result is converted to the station format.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use phonepatch_core::{PcmFormat, SampleFormat};
use tracing::{debug, warn};

use crate::config::{PromptConfig, StationConfig};
use crate::shell;

/// Turns prompt strings into PCM in the station format.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    sounds_dir: PathBuf,
    language: String,
    tts_command: Option<String>,
    convert_command: Option<String>,
    format: PcmFormat,
}

impl PromptRenderer {
    pub fn new(station: &StationConfig, prompts: &PromptConfig, format: PcmFormat) -> Self {
        PromptRenderer {
            sounds_dir: station.sounds_dir.clone(),
            language: station.language.clone(),
            tts_command: prompts.tts_command.clone(),
            convert_command: prompts.convert_command.clone(),
            format,
        }
    }

    /// Render `prompt`. Any item that cannot be rendered makes the whole
    /// prompt empty.
    pub async fn render(&self, prompt: &str, username: &str) -> Bytes {
        let prompt = prompt.replace("%u", username);
        let mut out = Vec::new();
        for item in prompt.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let rendered = match item.strip_prefix('@') {
                Some(text) => self.speak(text).await,
                None => self.convert(item).await,
            };
            match rendered {
                Some(pcm) => out.extend_from_slice(&pcm),
                None => {
                    warn!(item, "Prompt item not rendered");
                    return Bytes::new();
                }
            }
        }
        debug!(prompt = %prompt, bytes = out.len(), "Prompt rendered");
        Bytes::from(out)
    }

    async fn speak(&self, text: &str) -> Option<Vec<u8>> {
        let command = self.tts_command.as_deref()?;
        let command = command.replace("{rate}", &self.format.sample_rate().to_string());
        let output = shell::run(&command, Some(text.as_bytes())).await.ok()?;
        self.finish(output)
    }

    async fn convert(&self, item: &str) -> Option<Vec<u8>> {
        let command = self.convert_command.as_deref()?;
        let path = self.find_sound(item)?;
        let command = command
            .replace("{file}", &shell::quote(&path.to_string_lossy()))
            .replace("{rate}", &self.format.sample_rate().to_string());
        let output = shell::run(&command, None).await.ok()?;
        self.finish(output)
    }

    fn finish(&self, output: std::process::Output) -> Option<Vec<u8>> {
        if !output.status.success() || output.stdout.is_empty() {
            return None;
        }
        Some(self.normalize(&output.stdout))
    }

    /// Convert helper output (S16_LE mono) to the station format.
    fn normalize(&self, pcm: &[u8]) -> Vec<u8> {
        let helper = PcmFormat::new(SampleFormat::S16Le, 1, self.format.sample_rate())
            .unwrap_or_else(|_| PcmFormat::telephony());
        if helper == self.format {
            return pcm[..helper.frames_in(pcm.len()) * 2].to_vec();
        }
        let mut out = Vec::new();
        self.format.encode_mono(&helper.decode_mono(pcm), &mut out);
        out
    }

    fn find_sound(&self, item: &str) -> Option<PathBuf> {
        let path = Path::new(item);
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        [
            self.sounds_dir.join(&self.language).join(path),
            self.sounds_dir.join(path),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }
}

/// The last prompt rendered for a call, kept so repeats (ring, incall
/// report) do not run the helpers again.
#[derive(Debug, Clone, Default)]
pub struct PromptCache {
    key: Option<(String, String)>,
    audio: Bytes,
}

impl PromptCache {
    pub async fn render(&mut self, renderer: &PromptRenderer, prompt: &str, username: &str) -> Bytes {
        let key = (prompt.to_owned(), username.to_owned());
        if self.key.as_ref() != Some(&key) {
            self.audio = renderer.render(prompt, username).await;
            self.key = Some(key);
        }
        self.audio.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer(dir: &Path, tts: Option<&str>, convert: Option<&str>) -> PromptRenderer {
        let station = StationConfig {
            sounds_dir: dir.to_path_buf(),
            language: "en".into(),
            ..StationConfig::default()
        };
        let prompts = PromptConfig {
            tts_command: tts.map(Into::into),
            convert_command: convert.map(Into::into),
            ..PromptConfig::default()
        };
        PromptRenderer::new(&station, &prompts, PcmFormat::telephony())
    }

    #[tokio::test]
    async fn text_goes_through_tts_with_username() {
        let dir = tempfile::tempdir().unwrap();
        let r = renderer(dir.path(), Some("cat"), None);
        let audio = r.render("@Hi %u", "abc").await;
        assert_eq!(&audio[..], b"Hi abc");
    }

    #[tokio::test]
    async fn files_prefer_language_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("en")).unwrap();
        std::fs::write(dir.path().join("en/ring.raw"), b"EN").unwrap();
        std::fs::write(dir.path().join("ring.raw"), b"XX").unwrap();
        std::fs::write(dir.path().join("tone.raw"), b"TT").unwrap();
        let r = renderer(dir.path(), None, Some("cat {file}"));

        assert_eq!(&r.render("ring.raw", "").await[..], b"EN");
        assert_eq!(&r.render("tone.raw, ring.raw", "").await[..], b"TTEN");
    }

    #[tokio::test]
    async fn any_failed_item_empties_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let r = renderer(dir.path(), Some("cat"), Some("cat {file}"));
        assert!(r.render("@hello, missing.wav", "").await.is_empty());

        let no_tts = renderer(dir.path(), None, None);
        assert!(no_tts.render("@hello", "").await.is_empty());
    }

    #[tokio::test]
    async fn cache_skips_repeat_renders() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let tts = format!("echo x >> {}; cat", counter.display());
        let r = renderer(dir.path(), Some(&tts), None);
        let mut cache = PromptCache::default();

        assert_eq!(&cache.render(&r, "@ring", "u").await[..], b"ring");
        assert_eq!(&cache.render(&r, "@ring", "u").await[..], b"ring");
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }
}
