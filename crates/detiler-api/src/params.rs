//! Query-string access with repeated array parameters.

use std::str::FromStr;

/// Raw `(name, value)` pairs in request order.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(pub Vec<(String, String)>);

impl QueryParams {
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| matches(k, name))
    }

    /// All values of `name`, accepting both `name` and `name[]`.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| matches(k, name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value of `name`, accepting both `name` and `name[]`.
    pub fn one(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| matches(k, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, String> {
        self.one(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| format!("invalid value {raw:?} for parameter {name}"))
            })
            .transpose()
    }

    pub fn require<T: FromStr>(&self, name: &str) -> Result<T, String> {
        self.parse(name)?
            .ok_or_else(|| format!("missing required parameter {name}"))
    }

    pub fn parse_all<T: FromStr>(&self, name: &str) -> Result<Vec<T>, String> {
        self.all(name)
            .into_iter()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| format!("invalid value {raw:?} for parameter {name}"))
            })
            .collect()
    }
}

fn matches(key: &str, name: &str) -> bool {
    key == name || key.strip_suffix("[]") == Some(name)
}
