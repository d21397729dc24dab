//! Result classification and the end-of-run table.

use std::fmt::Write as _;

/// Exit status a scenario uses to report that it did not run.
pub const EXIT_SKIPPED: i32 = 77;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Passed,
    Skipped,
    Failed,
}

impl Status {
    /// A clean exit only counts as a pass when nothing was written to stderr.
    /// `None` means the process was killed by a signal.
    pub fn classify(exit_code: Option<i32>, stderr: &str) -> Self {
        match exit_code {
            Some(0) if stderr.is_empty() => Status::Passed,
            Some(EXIT_SKIPPED) => Status::Skipped,
            _ => Status::Failed,
        }
    }

    pub fn was_successful(self) -> bool {
        self != Status::Failed
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Passed => "Passed",
            Status::Skipped => "Skipped",
            Status::Failed => "Failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioResult {
    pub name: String,
    pub status: Status,
    /// Whole seconds.
    pub duration: u64,
}

impl ScenarioResult {
    fn sort_key(&self) -> (Status, String) {
        (self.status, self.name.to_lowercase())
    }
}

/// Terminal capabilities used when rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Style {
    pub ansi: bool,
    pub unicode: bool,
}

type Pair = (&'static str, &'static str);

const RESET: &str = "\x1b[0m";

impl Style {
    pub const PLAIN: Style = Style {
        ansi: false,
        unicode: false,
    };

    /// Unicode glyphs unless the locale says the terminal cannot show them.
    pub fn detect(ansi: bool) -> Self {
        let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|value| !value.is_empty());
        let unicode = match locale {
            Some(locale) => {
                let locale = locale.to_ascii_lowercase();
                locale.contains("utf-8") || locale.contains("utf8")
            }
            None => true,
        };
        Style { ansi, unicode }
    }

    fn pick(&self, on: &'static str) -> Pair {
        if self.ansi {
            (RESET, on)
        } else {
            ("", "")
        }
    }

    pub fn bold(&self) -> Pair {
        self.pick("\x1b[1m")
    }

    pub fn green(&self) -> Pair {
        self.pick("\x1b[0;32m")
    }

    pub fn red(&self) -> Pair {
        self.pick("\x1b[0;31m")
    }

    pub fn grey(&self) -> Pair {
        self.pick("\x1b[1;30m")
    }

    pub fn glyph(&self, status: Status) -> &'static str {
        match (status, self.unicode) {
            (Status::Passed, true) => "✓ ",
            (Status::Failed, true) => "✖ ",
            (Status::Skipped, true) => "○ ",
            (Status::Passed, false) => "P ",
            (Status::Failed, false) => "x ",
            (Status::Skipped, false) => "o ",
        }
    }

    fn color(&self, status: Status) -> Pair {
        match status {
            Status::Passed => self.green(),
            Status::Skipped => self.grey(),
            Status::Failed => self.red(),
        }
    }
}

/// Renders the summary table. Rows are ordered passed, skipped, failed and
/// then by name; `width` is the widest scenario name of the run.
pub fn render(results: &[ScenarioResult], width: usize, runtime: u64, style: Style) -> String {
    let mut sorted: Vec<&ScenarioResult> = results.iter().collect();
    sorted.sort_by_key(|result| result.sort_key());
    let width = width.max("TEST".len()).max("ALL".len());
    let bold = style.bold();

    let mut out = String::new();
    let _ = write!(
        out,
        "\n{}{:<width$} | {} | {}\n\n{}",
        bold.1, "TEST", "STATUS   ", "DURATION", bold.0
    );

    let mut all_passed = true;
    let mut accumulated = 0;
    for result in sorted {
        all_passed &= result.status.was_successful();
        accumulated += result.duration;
        let color = style.color(result.status);
        let _ = writeln!(
            out,
            "{}{:<width$} | {}{:<7} | {} s{}",
            color.1,
            result.name,
            style.glyph(result.status),
            result.status.label(),
            result.duration,
            color.0
        );
    }

    let overall = if all_passed {
        Status::Passed
    } else {
        Status::Failed
    };
    let summary = format!("{}{}", style.glyph(overall), overall.label());
    let red = style.red();
    if !all_passed {
        out.push_str(red.1);
    }
    let _ = write!(
        out,
        "{}\n{:<width$} | {:<9} | {} s (accumulated) \n{}",
        bold.1, "ALL", summary, accumulated, bold.0
    );
    if !all_passed {
        out.push_str(red.0);
    }
    let _ = writeln!(out, "Runtime: {runtime} s");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: Status, duration: u64) -> ScenarioResult {
        ScenarioResult {
            name: name.into(),
            status,
            duration,
        }
    }

    #[test]
    fn classification() {
        assert_eq!(Status::classify(Some(0), ""), Status::Passed);
        assert_eq!(Status::classify(Some(0), "warning\n"), Status::Failed);
        assert_eq!(Status::classify(Some(77), "anything"), Status::Skipped);
        assert_eq!(Status::classify(Some(1), ""), Status::Failed);
        assert_eq!(Status::classify(None, ""), Status::Failed);
        assert!(Status::Skipped.was_successful());
    }

    #[test]
    fn table_is_sorted_and_aligned() {
        let results = [
            result("zeta", Status::Failed, 3),
            result("mn_activation", Status::Skipped, 0),
            result("Alpha", Status::Passed, 4),
            result("beta", Status::Passed, 2),
        ];
        let table = render(&results, 13, 7, Style::PLAIN);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[1], "TEST          | STATUS    | DURATION");
        assert_eq!(lines[3], "Alpha         | P Passed  | 4 s");
        assert_eq!(lines[4], "beta          | P Passed  | 2 s");
        assert_eq!(lines[5], "mn_activation | o Skipped | 0 s");
        assert_eq!(lines[6], "zeta          | x Failed  | 3 s");
        assert_eq!(lines[8], "ALL           | x Failed  | 9 s (accumulated) ");
        assert_eq!(lines[9], "Runtime: 7 s");
    }

    #[test]
    fn all_row_passes_when_nothing_failed() {
        let results = [
            result("a", Status::Passed, 1),
            result("b", Status::Skipped, 1),
        ];
        let style = Style {
            ansi: false,
            unicode: true,
        };
        let table = render(&results, 1, 2, style);
        assert!(table.contains("ALL  | ✓ Passed  | 2 s (accumulated)"));
    }

    #[test]
    fn ansi_wraps_failures_in_red() {
        let style = Style {
            ansi: true,
            unicode: false,
        };
        let table = render(&[result("x", Status::Failed, 0)], 1, 0, style);
        assert!(table.contains("\x1b[0;31mx    | x Failed  | 0 s\x1b[0m"));
        assert!(table.ends_with("\x1b[0mRuntime: 0 s\n"));
    }
}
