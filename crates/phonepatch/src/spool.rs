//! Outcall requests for the PBX, written as call files to its spool
//! directory.
//!
//! The PBX picks an entry up by removing it, so the entry's presence is
//! the request's state: present means still pending.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::dialing::DialTarget;
use crate::error::Result;

/// Account code marking calls placed by the phonepatch.
pub const ACCOUNT: &str = "_phonepatch_";

/// One call file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    pub channel: String,
    pub max_retries: u32,
    pub retry_time: u32,
    pub context: String,
    pub extension: String,
    pub wait_time: u32,
    pub priority: u32,
    pub account: String,
    pub callerid: String,
}

impl SpoolEntry {
    pub fn for_target(config: &Config, target: &DialTarget) -> Self {
        let outcall = &config.outcall;
        let username = target.extension.username(&config.station);
        SpoolEntry {
            channel: outcall.channel.replace("%x", &target.number),
            max_retries: 0,
            retry_time: 60,
            context: outcall.context.clone(),
            extension: target.pbx_extension.clone(),
            wait_time: outcall.timeout,
            priority: outcall.priority,
            account: ACCOUNT.into(),
            callerid: outcall
                .callerid
                .clone()
                .unwrap_or_else(|| format!("{username} <{}>", target.extension.id)),
        }
    }

    /// The `Key: value` text of the entry.
    pub fn render(&self) -> String {
        format!(
            "Channel: {}\n\
             MaxRetries: {}\n\
             RetryTime: {}\n\
             Context: {}\n\
             Extension: {}\n\
             WaitTime: {}\n\
             Priority: {}\n\
             Account: {}\n\
             CallerID: {}\n",
            self.channel,
            self.max_retries,
            self.retry_time,
            self.context,
            self.extension,
            self.wait_time,
            self.priority,
            self.account,
            self.callerid,
        )
    }

    /// Write the entry to `scratch_dir` and move it into `spool_dir` in one
    /// rename, so the PBX never sees a partial file.
    pub fn submit(&self, scratch_dir: &Path, spool_dir: &Path) -> Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix("phonepatch-")
            .suffix(".call")
            .tempfile_in(scratch_dir)?;
        file.write_all(self.render().as_bytes())?;
        file.flush()?;

        let name = file
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "phonepatch.call".into());
        let dest = spool_dir.join(&name);
        if let Err(e) = file.persist(&dest) {
            // Different filesystems: copy next to the destination, then rename.
            debug!(error = %e.error, "Rename into spool failed, copying");
            let mut staging = name.clone();
            staging.push(".tmp");
            let staging = spool_dir.join(staging);
            std::fs::copy(e.file.path(), &staging)?;
            std::fs::rename(&staging, &dest)?;
        }
        info!(path = %dest.display(), channel = %self.channel, "Outcall spooled");
        Ok(dest)
    }
}

/// Remove an entry the PBX never picked up. Missing is fine.
pub fn withdraw(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Spool entry withdrawn");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialing::resolve_dial;

    #[test]
    fn entry_fields_from_config() {
        let config = Config::parse(
            r#"
            [station]
            username = "ham"

            [outcall]
            channel = "IAX2/trunk/%x"
            context = "radio"
            timeout = 45

            [[extension]]
            id = "200"
            "#,
        )
        .unwrap();
        let target = resolve_dial(&config, None, "5551234").unwrap();
        let entry = SpoolEntry::for_target(&config, &target);

        assert_eq!(
            entry.render(),
            "Channel: IAX2/trunk/5551234\n\
             MaxRetries: 0\n\
             RetryTime: 60\n\
             Context: radio\n\
             Extension: 200\n\
             WaitTime: 45\n\
             Priority: 1\n\
             Account: _phonepatch_\n\
             CallerID: ham <200>\n"
        );
    }

    #[test]
    fn submit_moves_entry_into_spool() {
        let scratch = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        let config = Config::default();
        let target = resolve_dial(&config, None, "42").unwrap();
        let entry = SpoolEntry::for_target(&config, &target);

        let path = entry.submit(scratch.path(), spool.path()).unwrap();
        assert!(path.starts_with(spool.path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), entry.render());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        withdraw(&path).unwrap();
        assert!(!path.exists());
        withdraw(&path).unwrap();
    }
}
