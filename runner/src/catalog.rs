//! Known scenarios and the rules for picking which ones a run executes.

use glob::Pattern;
use regex::Regex;

use crate::RunnerResult;

/// Scenarios run by default. Longest first so parallel runs finish sooner.
pub const BASE_SCENARIOS: &[&str] = &["chain_split", "block_sync"];

/// Scenarios only run with `--extended`.
pub const EXTENDED_SCENARIOS: &[&str] = &["mn_stored_broadcast", "mn_activation"];

/// Outcome of [`select`]: the scenarios to run plus what the caller asked for
/// that could not be honoured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub scenarios: Vec<String>,
    /// Requested patterns that matched nothing in the catalog.
    pub unknown: Vec<String>,
    /// Exclusions that matched nothing in the selection.
    pub unmatched_excludes: Vec<String>,
}

/// Extended scenarios come first; they are the slowest.
pub fn catalog() -> impl Iterator<Item = &'static str> {
    EXTENDED_SCENARIOS
        .iter()
        .chain(BASE_SCENARIOS.iter())
        .copied()
}

fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Builds the run list.
///
/// Requested names may carry a directory prefix, which is ignored. Glob
/// patterns are matched against the catalog; plain names are taken as given so
/// ad hoc scenarios can be run without registering them. With nothing
/// requested the base list (and the extended list when asked) is used.
pub fn select(
    requested: &[String],
    extended: bool,
    exclude: &[String],
    filter: Option<&str>,
) -> RunnerResult<Selection> {
    let mut selection = Selection::default();
    if requested.is_empty() {
        if extended {
            selection.scenarios.extend(catalog().map(str::to_string));
        } else {
            selection
                .scenarios
                .extend(BASE_SCENARIOS.iter().map(|name| name.to_string()));
        }
    }
    for request in requested {
        let name = request.rsplit('/').next().unwrap_or(request);
        if is_pattern(name) {
            let pattern = Pattern::new(name)?;
            let before = selection.scenarios.len();
            selection.scenarios.extend(
                catalog()
                    .filter(|candidate| pattern.matches(candidate))
                    .map(str::to_string),
            );
            if selection.scenarios.len() == before {
                selection.unknown.push(request.clone());
            }
        } else if name.is_empty() {
            selection.unknown.push(request.clone());
        } else {
            selection.scenarios.push(name.to_string());
        }
    }

    for excluded in exclude.iter().map(|name| name.trim()).filter(|name| !name.is_empty()) {
        let before = selection.scenarios.len();
        selection.scenarios.retain(|name| scenario_program(name) != excluded);
        if selection.scenarios.len() == before {
            selection.unmatched_excludes.push(excluded.to_string());
        }
    }

    if let Some(filter) = filter {
        let filter = Regex::new(filter)?;
        selection.scenarios.retain(|name| filter.is_match(name));
    }

    let mut seen = std::collections::HashSet::new();
    selection.scenarios.retain(|name| seen.insert(name.clone()));
    Ok(selection)
}

/// Program name of a scenario entry; anything after the first space is
/// passed to it as arguments.
pub fn scenario_program(entry: &str) -> &str {
    entry.split_whitespace().next().unwrap_or(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn defaults_to_base_list() {
        let selection = select(&[], false, &[], None).unwrap();
        assert_eq!(selection.scenarios, names(BASE_SCENARIOS));
        let extended = select(&[], true, &[], None).unwrap();
        assert_eq!(extended.scenarios.len(), 4);
        assert_eq!(extended.scenarios[0], EXTENDED_SCENARIOS[0]);
    }

    #[test]
    fn globs_match_the_catalog_and_literals_pass_through() {
        let selection = select(
            &names(&["mn_*", "./custom_check", "nothing*", "mn_activation"]),
            false,
            &[],
            None,
        )
        .unwrap();
        assert_eq!(
            selection.scenarios,
            names(&["mn_stored_broadcast", "mn_activation", "custom_check"])
        );
        assert_eq!(selection.unknown, names(&["nothing*"]));
    }

    #[test]
    fn exclude_and_filter_narrow_the_list() {
        let selection = select(
            &[],
            true,
            &names(&["chain_split", "missing"]),
            Some("^mn_|sync"),
        )
        .unwrap();
        assert_eq!(
            selection.scenarios,
            names(&["mn_stored_broadcast", "mn_activation", "block_sync"])
        );
        assert_eq!(selection.unmatched_excludes, names(&["missing"]));
    }

    #[test]
    fn exclusion_covers_entries_with_arguments() {
        let selection = select(
            &names(&["block_sync --long", "chain_split"]),
            false,
            &names(&["block_sync"]),
            None,
        )
        .unwrap();
        assert_eq!(selection.scenarios, names(&["chain_split"]));
    }

    #[test]
    fn bad_filter_is_an_error() {
        assert!(select(&[], false, &[], Some("(")).is_err());
        assert!(select(&names(&["[x"]), false, &[], None).is_err());
    }
}
