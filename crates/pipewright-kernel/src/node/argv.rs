//! Argument formatting: logical options and positionals to a literal argv.
//!
//! Nodes store arguments logically. A node's `ArgStyle` decides how keyword
//! options are spelled on the command line:
//!
//! ```text
//!   opt("n", 5)            -n 5
//!   opt("max_count", 5)    --max-count 5         (hyphenate)
//!   opt("v", true)         -v
//!   opt("v", false)        (nothing)
//!   opt("e", ["a", "b"])   -e a -e b             (Repeat::Option)
//!                          -e a,b                (Repeat::Join(","))
//!                          -e a b                (Repeat::Follow)
//!   joiner "="             --max-count=5
//! ```
//!
//! Options always precede positionals. A separator such as `--` is inserted
//! once before the positionals when one of them looks like an option.

use serde::{Deserialize, Serialize};

/// Value of a keyword option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptValue {
    /// `true` emits a bare flag, `false` emits nothing.
    Flag(bool),
    Text(String),
    List(Vec<String>),
    /// Explicitly absent; emits nothing.
    None,
}

impl From<bool> for OptValue {
    fn from(flag: bool) -> Self {
        OptValue::Flag(flag)
    }
}

impl From<&str> for OptValue {
    fn from(text: &str) -> Self {
        OptValue::Text(text.to_string())
    }
}

impl From<String> for OptValue {
    fn from(text: String) -> Self {
        OptValue::Text(text)
    }
}

macro_rules! opt_value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for OptValue {
            fn from(n: $t) -> Self {
                OptValue::Text(n.to_string())
            }
        })*
    };
}

opt_value_from_int!(i32, i64, u32, u64, usize);

impl<T: ToString> From<Vec<T>> for OptValue {
    fn from(items: Vec<T>) -> Self {
        OptValue::List(items.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString, const N: usize> From<[T; N]> for OptValue {
    fn from(items: [T; N]) -> Self {
        OptValue::List(items.iter().map(ToString::to_string).collect())
    }
}

impl<T: Into<OptValue>> From<Option<T>> for OptValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(OptValue::None)
    }
}

/// How list values are spelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// Repeat the option for each value.
    Option,
    /// Join the values with a separator into one value.
    Join(String),
    /// Put every value after a single option.
    Follow,
}

/// Naming convention for one command's options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgStyle {
    /// Prefix for single-character options.
    pub short: String,
    /// Prefix for longer options.
    pub long: String,
    /// Turn `_` in option names into `-`.
    pub hyphenate: bool,
    /// Glue between option and value (`=`); `None` passes the value as its
    /// own argument.
    pub joiner: Option<String>,
    pub repeat: Repeat,
    /// Inserted before the positionals when one of them starts with `-`.
    pub separator: Option<String>,
}

impl Default for ArgStyle {
    fn default() -> Self {
        Self {
            short: "-".to_string(),
            long: "--".to_string(),
            hyphenate: true,
            joiner: None,
            repeat: Repeat::Option,
            separator: None,
        }
    }
}

/// One logical argument of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    /// Passed through as-is.
    Positional(String),
    /// Spelled according to the node's `ArgStyle`.
    Option { name: String, value: OptValue },
}

impl ArgStyle {
    /// Style with `=` between long options and their values.
    pub fn gnu() -> Self {
        Self {
            joiner: Some("=".to_string()),
            ..Self::default()
        }
    }

    pub fn with_joiner(mut self, joiner: impl Into<String>) -> Self {
        self.joiner = Some(joiner.into());
        self
    }

    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn without_hyphenation(mut self) -> Self {
        self.hyphenate = false;
        self
    }

    /// Spell the option prefix for `name`.
    fn option_name(&self, name: &str) -> String {
        let name = if self.hyphenate {
            name.replace('_', "-")
        } else {
            name.to_string()
        };
        if name.starts_with('-') {
            return name;
        }
        let prefix = if name.chars().count() == 1 {
            &self.short
        } else {
            &self.long
        };
        format!("{prefix}{name}")
    }

    fn format_option(&self, name: &str, value: &OptValue, out: &mut Vec<String>) {
        let option = self.option_name(name);
        let values: Vec<String> = match value {
            OptValue::Flag(true) => {
                out.push(option);
                return;
            }
            OptValue::Flag(false) | OptValue::None => return,
            OptValue::Text(text) => vec![text.clone()],
            OptValue::List(items) => items.clone(),
        };

        let values = match &self.repeat {
            Repeat::Follow => {
                out.push(option);
                out.extend(values);
                return;
            }
            Repeat::Join(sep) => vec![values.join(sep)],
            Repeat::Option => values,
        };

        for value in values {
            match &self.joiner {
                Some(joiner) => out.push(format!("{option}{joiner}{value}")),
                None => {
                    out.push(option.clone());
                    out.push(value);
                }
            }
        }
    }

    /// Produce the literal argv (without the program name).
    pub fn format(&self, args: &[Arg]) -> Vec<String> {
        let mut out = Vec::new();
        let mut positionals = Vec::new();

        for arg in args {
            match arg {
                Arg::Option { name, value } => self.format_option(name, value, &mut out),
                Arg::Positional(text) => positionals.push(text.clone()),
            }
        }

        if let Some(sep) = &self.separator
            && positionals.iter().any(|p| p.starts_with('-'))
        {
            out.push(sep.clone());
        }
        out.extend(positionals);
        out
    }
}
