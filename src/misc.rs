use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use owo_colors::AnsiColors;
use stacked_errors::{Result, StackableErr};

/// Set by the handler that [ctrlc_init] installs
pub static CTRLC_ISSUED: AtomicBool = AtomicBool::new(false);

/// Installs a Ctrl-C handler that only sets `CTRLC_ISSUED`. Long running
/// loops such as the `watch` mode check it with [ctrlc_issued_reset].
pub fn ctrlc_init() -> Result<()> {
    ctrlc::set_handler(move || {
        CTRLC_ISSUED.store(true, Ordering::SeqCst);
    })
    .stack_err("ctrlc_init -> failed to set the ctrl-c handler")?;
    Ok(())
}

/// Returns if `CTRLC_ISSUED` has been set, and resets it to `false`
pub fn ctrlc_issued_reset() -> bool {
    CTRLC_ISSUED.swap(false, Ordering::SeqCst)
}

static NEXT_TERMINAL_COLOR: AtomicUsize = AtomicUsize::new(0);

// the dark and white colors are hard to read on common terminal themes
const TERMINAL_COLORS: [AnsiColors; 6] = [
    AnsiColors::Cyan,
    AnsiColors::Green,
    AnsiColors::Magenta,
    AnsiColors::Yellow,
    AnsiColors::Blue,
    AnsiColors::Red,
];

/// Cycles through a set of terminal colors so that the debug output of
/// concurrent commands can be told apart
pub fn next_terminal_color() -> AnsiColors {
    let i = NEXT_TERMINAL_COLOR.fetch_add(1, Ordering::Relaxed);
    TERMINAL_COLORS[i % TERMINAL_COLORS.len()]
}
