use std::io::Write;

/// Number of cells in the rendered bar.
pub const BAR_WIDTH: usize = 50;

/// Receives the fraction of the timeout that has elapsed.
///
/// Implementations must return quickly; they are called from the supervision
/// loop on every tick.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);

    /// Called once when progress reporting for a run ends.
    fn finish(&self) {}
}

/// Render `|----      | 40 %\r`.
///
/// The trailing carriage return lets the next render overwrite this one.
pub fn render_progress_bar(fraction: f64) -> String {
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
    let filled = (BAR_WIDTH as f64 * fraction) as usize;

    let mut bar = String::with_capacity(BAR_WIDTH + 10);
    bar.push('|');
    for i in 0..BAR_WIDTH {
        bar.push(if i < filled { '-' } else { ' ' });
    }
    bar.push('|');
    bar.push_str(&format!(" {} %\r", (fraction * 100.0) as u32));
    bar
}

/// Draws the bar on stdout, redrawing in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, fraction: f64) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(render_progress_bar(fraction).as_bytes());
        let _ = out.flush();
    }

    fn finish(&self) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bar() {
        let bar = render_progress_bar(0.0);
        assert_eq!(bar, format!("|{}| 0 %\r", " ".repeat(BAR_WIDTH)));
    }

    #[test]
    fn test_full_bar() {
        let bar = render_progress_bar(1.0);
        assert_eq!(bar, format!("|{}| 100 %\r", "-".repeat(BAR_WIDTH)));
    }

    #[test]
    fn test_partial_bar() {
        let bar = render_progress_bar(0.4);
        let expected = format!("|{}{}| 40 %\r", "-".repeat(20), " ".repeat(30));
        assert_eq!(bar, expected);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(render_progress_bar(1.7), render_progress_bar(1.0));
        assert_eq!(render_progress_bar(-0.3), render_progress_bar(0.0));
        assert_eq!(render_progress_bar(f64::NAN), render_progress_bar(0.0));
    }

    #[test]
    fn test_bar_has_no_line_break() {
        assert!(!render_progress_bar(0.5).contains('\n'));
    }
}
