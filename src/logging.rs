//! Logging backend which writes to stderr and, optionally, to a file.

use chrono::Local;
use eyre::{eyre, Context, Result};
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{mpsc, Mutex},
    time::Duration,
};

/// Environment variable holding the maximum level to log, such as `debug`.
pub const LEVEL_VAR: &str = "TORCHFIX_LOG";

/// Environment variable naming a file that log messages are also written to.
pub const FILE_VAR: &str = "TORCHFIX_LOG_FILE";

struct Message {
    module: String,
    level: Level,
    string: String,
    time: String,
}

impl Message {
    fn new(record: &Record) -> Message {
        let module = record
            .module_path()
            .unwrap_or_else(|| record.target())
            .split("::")
            .last()
            .unwrap_or("unknown")
            .to_string();

        Message {
            module,
            level: record.level(),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    fn line(&self) -> String {
        let level_name = match self.level {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };

        //      [date time] [module] [level] Text
        format!(
            "[{}] [{}] [{}] {}",
            self.time, self.module, level_name, self.string
        )
    }
}

/// Work for the writer thread.
enum Entry {
    Line(Message),

    /// Flush every output, then acknowledge through the contained sender.
    Flush(mpsc::SyncSender<()>),
}

/// How long `flush` waits for queued messages to be written.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let message = Message::new(record);

        let sent = match MSG_SENDER.get().map(Mutex::lock) {
            Some(Ok(sender)) => sender.send(Entry::Line(message)).map_err(|err| err.0),
            _ => Err(Entry::Line(message)),
        };

        // The writer thread is gone, so write the message ourselves.
        if let Err(Entry::Line(message)) = sent {
            eprintln!("{}", message.line());
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    /// Blocks until every message logged so far has been written.
    fn flush(&self) {
        if let Some(Ok(sender)) = MSG_SENDER.get().map(Mutex::lock) {
            if !wait_for_writer(&sender) {
                eprintln!("torchfix: timed out waiting for log messages to be written");
            }
        }
    }
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Entry>>> = OnceCell::new();

/// Starts a thread that writes each line it receives to every output.
fn spawn_writer(mut outputs: Vec<Box<dyn Write + Send>>) -> mpsc::Sender<Entry> {
    let (sender, receiver) = mpsc::channel();

    std::thread::spawn(move || {
        for entry in receiver {
            match entry {
                Entry::Line(msg) => {
                    let line = msg.line();

                    for output in &mut outputs {
                        let _ = writeln!(output, "{line}");
                    }
                }

                Entry::Flush(done) => {
                    for output in &mut outputs {
                        let _ = output.flush();
                    }

                    let _ = done.send(());
                }
            }
        }
    });

    sender
}

/// Queues a flush behind everything already sent and waits for the writer to reach it.
fn wait_for_writer(sender: &mpsc::Sender<Entry>) -> bool {
    let (done, acknowledged) = mpsc::sync_channel(1);

    sender.send(Entry::Flush(done)).is_ok() && acknowledged.recv_timeout(FLUSH_TIMEOUT).is_ok()
}

fn parse_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Installs the logger, configured from `TORCHFIX_LOG` and `TORCHFIX_LOG_FILE`. Does nothing if
/// it has already been installed.
pub fn init() -> Result<()> {
    let level = parse_level(std::env::var(LEVEL_VAR).ok().as_deref());
    let file = std::env::var_os(FILE_VAR).map(PathBuf::from);

    init_with(level, file)
}

pub fn init_with(level: LevelFilter, log_file: Option<PathBuf>) -> Result<()> {
    if MSG_SENDER.get().is_some() {
        return Ok(());
    }

    let mut outputs: Vec<Box<dyn Write + Send>> = vec![Box::new(std::io::stderr())];

    if let Some(path) = log_file {
        let file =
            File::create(&path).wrap_err_with(|| format!("failed to create log file {path:?}"))?;
        outputs.push(Box::new(file));
    }

    MSG_SENDER
        .set(Mutex::new(spawn_writer(outputs)))
        .map_err(|_| eyre!("logger has already been initialised"))?;

    log::set_logger(&LOGGER).map_err(|err| eyre!("unable to install logger: {err}"))?;
    log::set_max_level(level);

    Ok(())
}

/// A logger that keeps records in memory, for tests that check what was logged.
#[cfg(test)]
pub(crate) mod capture {
    use std::{
        sync::{Mutex, Once},
        thread::{self, ThreadId},
    };

    use log::{Level, LevelFilter, Metadata, Record};

    struct Capture;

    static RECORDS: Mutex<Vec<(ThreadId, Level, String)>> = Mutex::new(Vec::new());
    static INSTALL: Once = Once::new();

    impl log::Log for Capture {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            RECORDS.lock().unwrap().push((
                thread::current().id(),
                record.level(),
                record.args().to_string(),
            ));
        }

        fn flush(&self) {}
    }

    /// Starts capturing. Tests run on separate threads, so records are kept per thread.
    pub fn install() {
        INSTALL.call_once(|| {
            log::set_logger(&Capture).unwrap();
            log::set_max_level(LevelFilter::Trace);
        });
    }

    /// Returns the records logged so far by the current thread.
    pub fn records() -> Vec<(Level, String)> {
        let current = thread::current().id();

        RECORDS
            .lock()
            .unwrap()
            .iter()
            .filter(|(thread, _, _)| *thread == current)
            .map(|(_, level, message)| (*level, message.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let message = Message {
            module: "patch".to_string(),
            level: Level::Warn,
            string: "Detected pytorch version with libomp issue, patching.".to_string(),
            time: "2024-03-01 12:00:00.000".to_string(),
        };

        assert_eq!(
            message.line(),
            "[2024-03-01 12:00:00.000] [patch] [warning] Detected pytorch version with libomp issue, patching."
        );
    }

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(parse_level(None), LevelFilter::Info);
        assert_eq!(parse_level(Some("nonsense")), LevelFilter::Info);
        assert_eq!(parse_level(Some(" debug ")), LevelFilter::Debug);
        assert_eq!(parse_level(Some("OFF")), LevelFilter::Off);
    }

    #[test]
    fn module_name_is_last_path_segment() {
        let record = Record::builder()
            .level(Level::Info)
            .module_path(Some("torchfix::report"))
            .args(format_args!("hello"))
            .build();

        let message = Message::new(&record);
        assert_eq!(message.module, "report");
        assert_eq!(message.string, "hello");
    }

    #[test]
    fn flush_waits_for_queued_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torchfix.log");
        let file = File::create(&path).unwrap();

        let sender = spawn_writer(vec![Box::new(file)]);

        for i in 0..100 {
            let message = Message {
                module: "report".to_string(),
                level: Level::Info,
                string: format!("line {i}"),
                time: "2024-03-01 12:00:00.000".to_string(),
            };

            sender.send(Entry::Line(message)).unwrap();
        }

        assert!(wait_for_writer(&sender));

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 100);
        assert!(written.ends_with("[report] [info] line 99\n"));
    }

    #[test]
    fn flush_fails_without_writer() {
        let (sender, receiver) = mpsc::channel();
        drop(receiver);

        assert!(!wait_for_writer(&sender));
    }
}
