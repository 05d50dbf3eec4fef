use std::{fs::File, io::Write, path::Path, sync::Mutex};

use log::{LevelFilter, Log, Record};

use osutils::files;

use super::LogEntry;

/// Logger appending every record as a JSON line to a file.
///
/// Setting it up never fails: if the file cannot be created the logger simply
/// stays disabled.
pub struct BackgroundLog {
    target: Option<Mutex<File>>,
    max_level: LevelFilter,
}

impl BackgroundLog {
    /// Truncates or creates `target`, along with its parent directories.
    pub fn new(target: impl AsRef<Path>) -> Self {
        let target = target.as_ref();
        let file = match files::create_file(target) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!(
                    "Logging setup error: failed to create background log file '{}': {:?}",
                    target.display(),
                    err
                );
                None
            }
        };

        Self {
            max_level: LevelFilter::Trace,
            target: file,
        }
    }

    pub fn with_max_level(self, max_level: LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::from(record))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
            file_lock.flush()?;
        }

        Ok(())
    }
}

impl Log for BackgroundLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        // Best effort
        let _ = self.write_entry(record);
    }

    fn flush(&self) {}
}
