use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

/// Environment variable that overrides the configured directives.
const FILTER_ENV: &str = "RUST_LOG";

#[derive(Debug, PartialEq)]
struct Filter {
    module: Option<String>,
    level: Level,
}

impl Filter {
    #[inline]
    fn match_module(&self, module: &str) -> Option<&Self> {
        self.module.as_ref().map_or(Some(self), |prefix| {
            module.starts_with(prefix.as_str()).then(|| self)
        })
    }

    #[inline]
    fn match_level(&self, level: Level) -> bool {
        level.is_at_least(self.level)
    }
}

#[derive(Debug)]
struct Directives(Vec<Filter>);

impl Directives {
    #[inline]
    fn is_enabled(&self, module: &str, level: Level) -> bool {
        // Find the last-match filter and check the allowed level
        self.0
            .iter()
            .filter_map(|filter| filter.match_module(module))
            .last()
            .map(|filter| filter.match_level(level))
            .unwrap_or_default()
    }
}

/// Parse filter to be a list of valid prefix strings.
///
/// `module=level` or `level` where the module is a valid module
/// prefix and the level a supported level name (`critical`, `error`,
/// `warn`, `info`, `debug`, `trace`).
///
/// This method does not fail as it will ignore invalid directives.
impl From<&str> for Directives {
    fn from(filter: &str) -> Self {
        let filters = filter
            .split(',')
            .map(str::trim)
            .filter_map(|filter| {
                let kv = filter.split('=').collect::<Vec<_>>();
                if kv.len() == 1 {
                    Level::from_str(kv[0]).ok().map(|level| Filter {
                        module: None,
                        level,
                    })
                } else if kv.len() == 2 {
                    let key = kv[0]
                        .chars()
                        .all(|c| matches!(c, '0'..='9' | 'a'..='z' | 'A'..='Z' | ':' | '_'))
                        .then(|| kv[0].to_string());
                    key.and_then(|key| {
                        Level::from_str(kv[1]).ok().map(|level| Filter {
                            module: Some(key),
                            level,
                        })
                    })
                } else {
                    None
                }
            })
            .collect();

        Self(filters)
    }
}

/// Drain that drops records not matching the directives.
pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    pub fn with_default_filter(drain: T, filter: &str) -> Self {
        let directives = match env::var(FILTER_ENV) {
            Ok(filter) => Directives::from(filter.as_str()),
            Err(_) => Directives::from(filter),
        };

        Self { drain, directives }
    }
}

impl<T: Drain> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, info: &Record<'_>, val: &OwnedKVList) -> Result<(), T::Err> {
        if !self.directives.is_enabled(info.module(), info.level()) {
            return Ok(());
        }

        self.drain.log(info, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_level() {
        let directives = Directives::from("info");
        assert!(directives.is_enabled("cimd::server", Level::Warning));
        assert!(directives.is_enabled("cimd::server", Level::Info));
        assert!(!directives.is_enabled("cimd::server", Level::Debug));
    }

    #[test]
    fn test_last_match_wins() {
        let directives = Directives::from("warn,cimd::launcher=trace");
        assert!(directives.is_enabled("cimd::launcher", Level::Trace));
        assert!(!directives.is_enabled("cimd::server", Level::Info));
    }

    #[test]
    fn test_invalid_directives_are_ignored() {
        let directives = Directives::from("bogus,cimd-x=info,a=b=c,error");
        assert_eq!(
            directives.0,
            vec![Filter {
                module: None,
                level: Level::Error
            }]
        );
        assert!(!directives.is_enabled("cimd", Level::Warning));
    }

    #[test]
    fn test_empty_filter_disables_logging() {
        let directives = Directives::from("");
        assert!(!directives.is_enabled("cimd", Level::Critical));
    }
}
