use log::{debug, warn};
use std::{
    io::{BufRead, BufReader, Read},
    ops::ControlFlow,
    thread,
};

/// Feeds each line of `reader` to `f` until EOF, a read error, or `f`
/// breaks. Invalid UTF-8 is replaced rather than ending the stream.
/// Returns true when the stream was read to the end.
pub fn for_each_line<R: Read>(
    reader: R,
    mut f: impl FnMut(&str) -> ControlFlow<()>,
) -> bool {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return true,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if f(line).is_break() {
                    return false;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

/// Logs every line a child writes on one of its pipes as `(label) line`.
pub fn spawn_line_logger<R>(reader: R, label: &'static str)
where
    R: Read + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("output-{}", label))
        .spawn(move || {
            for_each_line(reader, |line| {
                debug!("({}) {}", label, line);
                ControlFlow::Continue(())
            });
        });
    if let Err(e) = spawned {
        warn!("Failed to start {} reader: {}", label, e);
    }
}
