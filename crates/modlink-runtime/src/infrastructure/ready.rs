//! Start-up handshake for supervisors and test harnesses.
//!
//! A process started with `--ready-pipe <PATH>` appends one `ready` line to
//! that file or FIFO once it serves.  The reader blocks on the pipe instead
//! of polling the process's ports.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// The line written once the process is ready.
pub const READY_LINE: &str = "ready";

/// Appends [`READY_LINE`] to `path`, creating a plain file when needed.
pub fn write_ready(path: &Path) -> io::Result<()> {
    let mut pipe = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(pipe, "{READY_LINE}")?;
    pipe.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_ready_appends_one_line_per_call() {
        // Arrange
        let path = std::env::temp_dir().join(format!("modlink-ready-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        // Act
        write_ready(&path).unwrap();
        write_ready(&path).unwrap();

        // Assert
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(text, "ready\nready\n");
    }
}
