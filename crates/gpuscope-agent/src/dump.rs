//! Debug dumps
//!
//! Optional, purely observational gather snapshots written under a
//! configured directory, gzip-compressed, with an hour-based retention
//! sweep. Dump failures are logged and never affect serving.

use flate2::write::GzEncoder;
use flate2::Compression;
use gpuscope_core::config::DumpConfig;
use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Write one gather snapshot and sweep expired dumps.
pub fn write_snapshot(config: &DumpConfig, body: &str) {
    if let Err(e) = try_write_snapshot(config, body) {
        warn!(error = %e, directory = %config.directory.display(), "failed to write debug dump");
    }
    sweep(config);
}

fn try_write_snapshot(config: &DumpConfig, body: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.directory)?;

    let stamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let name = if config.compression {
        format!("gather-{}.{:03}.txt.gz", stamp.as_secs(), stamp.subsec_millis())
    } else {
        format!("gather-{}.{:03}.txt", stamp.as_secs(), stamp.subsec_millis())
    };
    let path = config.directory.join(name);

    if config.compression {
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(body.as_bytes())?;
        encoder.finish()?;
    } else {
        std::fs::write(&path, body)?;
    }
    debug!(path = %path.display(), "wrote debug dump");
    Ok(())
}

/// Remove dumps older than the retention period.
fn sweep(config: &DumpConfig) {
    if config.retention_hours == 0 {
        return;
    }
    let max_age = Duration::from_secs(u64::from(config.retention_hours) * 3600);

    let entries = match std::fs::read_dir(&config.directory) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified.elapsed().map(|age| age > max_age).unwrap_or(false) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to remove expired dump");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_snapshot_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let config = DumpConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            retention_hours: 1,
            compression: true,
        };

        write_snapshot(&config, "metric 1\n");

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].file_name().to_string_lossy().ends_with(".txt.gz"));
    }

    #[test]
    fn test_write_snapshot_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let config = DumpConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            retention_hours: 0,
            compression: false,
        };

        write_snapshot(&config, "metric 1\n");

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].path()).unwrap();
        assert_eq!(content, "metric 1\n");
    }
}
