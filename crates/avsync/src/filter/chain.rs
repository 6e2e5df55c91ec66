//! Filter chain strings.
//!
//! A chain is a comma-separated list of `name[=arg[:arg...]]` entries, e.g.
//! `volume=0.5,atempo=1.25` or `crop=w=320:h=240,hflip`. Arguments are positional or
//! `key=value`.

use std::fmt;

use anyhow::{Result, anyhow, bail};

/// One parsed chain entry.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    pub args: Vec<FilterArg>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterArg {
    pub key: Option<String>,
    pub value: String,
}

impl FilterSpec {
    /// Look up an argument by key, falling back to its position among unnamed arguments.
    pub fn arg(&self, position: usize, key: &str) -> Option<&str> {
        if let Some(arg) = self
            .args
            .iter()
            .find(|a| a.key.as_deref() == Some(key))
        {
            return Some(arg.value.as_str());
        }
        self.args
            .iter()
            .filter(|a| a.key.is_none())
            .nth(position)
            .map(|a| a.value.as_str())
    }

    /// Parse an argument as `f64`.
    pub fn num_arg(&self, position: usize, key: &str) -> Result<Option<f64>> {
        match self.arg(position, key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| anyhow!("{}: invalid {key} {raw:?}", self.name)),
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            f.write_str(if i == 0 { "=" } else { ":" })?;
            if let Some(key) = &arg.key {
                write!(f, "{key}=")?;
            }
            f.write_str(&arg.value)?;
        }
        Ok(())
    }
}

/// Parse a chain string. An empty or whitespace-only chain yields no filters.
pub fn parse_chain(chain: &str) -> Result<Vec<FilterSpec>> {
    let mut out = Vec::new();
    for entry in chain.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, args) = match entry.split_once('=') {
            Some((name, args)) => (name.trim(), Some(args)),
            None => (entry, None),
        };
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("invalid filter name {name:?} in {entry:?}");
        }
        let args = match args {
            None => Vec::new(),
            Some(raw) => raw
                .split(':')
                .map(|arg| match arg.split_once('=') {
                    Some((k, v)) => FilterArg {
                        key: Some(k.trim().to_string()),
                        value: v.trim().to_string(),
                    },
                    None => FilterArg {
                        key: None,
                        value: arg.trim().to_string(),
                    },
                })
                .collect(),
        };
        out.push(FilterSpec {
            name: name.to_ascii_lowercase(),
            args,
        });
    }
    Ok(out)
}

/// Rewrite an audio chain for a playback rate.
///
/// Existing `atempo` entries are removed; a rate other than 1 appends `atempo` entries
/// (split into factors within `0.5..=2.0`).
pub fn with_tempo(chain: &str, rate: f64) -> String {
    let mut entries: Vec<String> = chain
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.starts_with("atempo="))
        .map(str::to_string)
        .collect();

    if rate.is_finite() && rate > 0.0 && (rate - 1.0).abs() > f64::EPSILON {
        let mut remaining = rate;
        while remaining > 2.0 {
            entries.push("atempo=2".to_string());
            remaining /= 2.0;
        }
        while remaining < 0.5 {
            entries.push("atempo=0.5".to_string());
            remaining /= 0.5;
        }
        if (remaining - 1.0).abs() > f64::EPSILON {
            entries.push(format!("atempo={remaining}"));
        }
    }
    entries.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_has_no_filters() {
        assert!(parse_chain("").unwrap().is_empty());
        assert!(parse_chain(" , ").unwrap().is_empty());
    }

    #[test]
    fn parses_positional_and_named_args() {
        let chain = parse_chain("volume=0.5, crop=w=320:h=240:10:20,hflip").unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].name, "volume");
        assert_eq!(chain[0].arg(0, "volume"), Some("0.5"));
        assert_eq!(chain[1].arg(0, "w"), Some("320"));
        assert_eq!(chain[1].arg(2, "x"), None);
        assert_eq!(chain[1].arg(0, "x"), Some("10"));
        assert_eq!(chain[1].num_arg(1, "y").unwrap(), Some(20.0));
        assert!(chain[2].args.is_empty());
        assert_eq!(chain[1].to_string(), "crop=w=320:h=240:10:20");
    }

    #[test]
    fn rejects_bad_names() {
        assert!(parse_chain("vol ume=1").is_err());
        assert!(parse_chain("=1").is_err());
    }

    #[test]
    fn tempo_rewrite_replaces_existing_entries() {
        assert_eq!(with_tempo("volume=2,atempo=1.5", 1.0), "volume=2");
        assert_eq!(with_tempo("", 1.25), "atempo=1.25");
        assert_eq!(with_tempo("atempo=0.8,volume=2", 1.5), "volume=2,atempo=1.5");
        assert_eq!(with_tempo("", 3.0), "atempo=2,atempo=1.5");
        assert_eq!(with_tempo("", 0.25), "atempo=0.5,atempo=0.5");
    }
}
