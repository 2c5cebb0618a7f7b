//! QEMU arguments with name-uniqueness constraints.
//!
//! Arguments are collected as (name, value) pairs and compiled into the
//! final string vector in one pass, at which point uniqueness is enforced:
//! a unique name may occur once, a repeatable name may not repeat the same
//! value.

use color_eyre::Result;

/// A single QEMU argument with or without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    name: String,
    value: String,
    unique: bool,
}

/// A unique argument collides with any other argument of the same name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("colliding arguments: {name}")]
pub struct ArgumentError {
    pub name: String,
}

impl Argument {
    /// An argument whose name may occur only once.
    pub fn unique(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unique: true,
        }
    }

    /// A value-less argument whose name may occur only once.
    pub fn unique_flag(name: impl Into<String>) -> Self {
        Self::unique(name, "")
    }

    /// An argument that may occur multiple times with distinct values.
    pub fn repeatable(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unique: false,
        }
    }

    /// Whether the two arguments may not coexist in one vector.
    fn collides_with(&self, other: &Argument) -> bool {
        if self.name != other.name {
            return false;
        }
        if self.unique || other.unique {
            return true;
        }
        self.value == other.value
    }
}

/// Compile the arguments into the string vector passed to the QEMU binary.
///
/// Fails on the first uniqueness violation.
pub fn build_argument_strings(args: &[Argument]) -> Result<Vec<String>, ArgumentError> {
    let mut strings = Vec::with_capacity(args.len() * 2);

    for (idx, arg) in args.iter().enumerate() {
        if args[..idx].iter().any(|prev| prev.collides_with(arg)) {
            return Err(ArgumentError {
                name: arg.name.clone(),
            });
        }

        strings.push(format!("-{}", arg.name));
        if !arg.value.is_empty() {
            strings.push(arg.value.clone());
        }
    }

    Ok(strings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_has_no_value_string() {
        let strings = build_argument_strings(&[
            Argument::unique_flag("no-reboot"),
            Argument::unique("m", "256"),
        ])
        .unwrap();

        assert_eq!(strings, vec!["-no-reboot", "-m", "256"]);
    }

    #[test]
    fn test_unique_name_collides() {
        let err = build_argument_strings(&[
            Argument::unique("machine", "q35"),
            Argument::unique("machine", "pc"),
        ])
        .unwrap_err();

        assert_eq!(err.name, "machine");
    }

    #[test]
    fn test_unique_collides_with_repeatable() {
        let result = build_argument_strings(&[
            Argument::repeatable("serial", "file:/dev/fd/1"),
            Argument::unique("serial", "none"),
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn test_repeatable_allows_distinct_values() {
        let strings = build_argument_strings(&[
            Argument::repeatable("serial", "file:/dev/fd/1"),
            Argument::repeatable("serial", "file:/dev/fd/3"),
        ])
        .unwrap();

        assert_eq!(
            strings,
            vec!["-serial", "file:/dev/fd/1", "-serial", "file:/dev/fd/3"]
        );
    }

    #[test]
    fn test_repeatable_rejects_same_value() {
        let result = build_argument_strings(&[
            Argument::repeatable("serial", "file:/dev/fd/1"),
            Argument::repeatable("serial", "file:/dev/fd/1"),
        ]);

        assert!(result.is_err());
    }
}
