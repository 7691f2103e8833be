use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::sync::Mutex;

/// Readiness line consumed by the launcher. Written without a level prefix.
const HANDSHAKE: &str = "OK";

/*
 * The launcher reads our stderr one line at a time and maps the leading
 * letter of each line back to a log level, so every record is a single
 * uppercase letter, a space, and the message. No colour, no target.
 */
pub struct InitLogger {
    level: Mutex<LevelFilter>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl InitLogger {
    pub fn new(level: LevelFilter) -> &'static Self {
        Self::with_output(level, Box::new(io::stderr()))
    }

    pub fn with_output(
        level: LevelFilter,
        output: Box<dyn Write + Send>,
    ) -> &'static Self {
        Box::leak(Box::new(Self {
            level: Mutex::new(level),
            output: Mutex::new(output),
        }))
    }

    pub fn init(&'static self) -> Result<&'static Self, log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(LevelFilter::Trace);
        Ok(self)
    }

    pub fn set_level(&self, level: LevelFilter) {
        *self.level.lock().expect("Failed to lock level") = level;
    }

    /// Tells the launcher that bootstrap finished and the control channel
    /// is accepting commands.
    pub fn handshake(&self) -> io::Result<()> {
        let mut output = self.output.lock().expect("Failed to lock output");
        writeln!(output, "{}", HANDSHAKE)?;
        output.flush()
    }
}

pub fn format_line(level: Level, message: &std::fmt::Arguments) -> String {
    let code = match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    };
    format!("{} {}", code, message)
}

impl Log for InitLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= *self.level.lock().expect("Failed to lock level")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), record.args());
        let mut output = self.output.lock().expect("Failed to lock output");
        let _ = writeln!(output, "{}", line);
        let _ = output.flush();
    }

    fn flush(&self) {
        let _ = self.output.lock().expect("Failed to lock output").flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_format_line_prefixes() {
        assert_eq!(
            format_line(Level::Error, &format_args!("boom {}", 1)),
            "E boom 1"
        );
        assert_eq!(format_line(Level::Warn, &format_args!("w")), "W w");
        assert_eq!(format_line(Level::Info, &format_args!("i")), "I i");
        assert_eq!(format_line(Level::Debug, &format_args!("d")), "D d");
        assert_eq!(format_line(Level::Trace, &format_args!("t")), "T t");
    }

    #[test]
    fn test_level_filtering_and_handshake() {
        let buffer = SharedBuffer::default();
        let output = Box::new(buffer.clone());
        let logger = InitLogger::with_output(LevelFilter::Info, output);

        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("hidden"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("shown"))
                .build(),
        );
        logger.handshake().unwrap();

        assert_eq!(buffer.contents(), "W shown\nOK\n");

        logger.set_level(LevelFilter::Trace);
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("now visible"))
                .build(),
        );
        assert!(buffer.contents().ends_with("D now visible\n"));
    }
}
