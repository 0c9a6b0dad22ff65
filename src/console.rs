// Console diagnostic sink for MLQOS
use core::fmt;

use crossbeam_queue::ArrayQueue;

/// Line-oriented console.
///
/// Every line is kept in a bounded history (the oldest line is dropped once
/// the history is full) and mirrored to the `log` facade under the
/// `console` target.
pub struct Console {
    history: ArrayQueue<String>,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Write one formatted line
    pub fn write_line(&self, args: fmt::Arguments) {
        let line = args.to_string();
        log::info!(target: "console", "{}", line);
        self.history.force_push(line);
    }

    /// Write a block of text, one history entry per line
    pub fn write_block(&self, text: &str) {
        for line in text.lines() {
            self.write_line(format_args!("{}", line));
        }
    }

    /// Take every buffered line, oldest first
    pub fn drain(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.history.len());
        while let Some(line) = self.history.pop() {
            lines.push(line);
        }
        lines
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Print a line on a kernel console.
#[macro_export]
macro_rules! kprintln {
    ($console:expr) => {
        $console.write_line(format_args!(""))
    };
    ($console:expr, $($arg:tt)*) => {
        $console.write_line(format_args!($($arg)*))
    };
}
