//! Command-template variable substitution.
//!
//! Templates in the configuration use POSIX-style `$NAME` (or `${NAME}`)
//! variables: `$IDFILE`, `$LISTOPT`, `$INSTANCE_ID` and friends. Expansion
//! happens in-process against an explicit variable table; the host shell is
//! never involved, and a variable that is not in the table expands to the
//! empty string rather than erroring.

use std::borrow::Cow;

/// Expands `$NAME` and `${NAME}` occurrences in `template` from `vars`.
///
/// Variables absent from `vars` expand to the empty string.
///
/// # Example
///
/// ```
/// use quarry::subst::expand;
///
/// let cmd = expand("runner $IDOPTION --profile=$PROFILE", &[
///     ("IDOPTION", "--load-list ids.txt"),
///     ("PROFILE", "py3"),
/// ]);
/// assert_eq!(cmd, "runner --load-list ids.txt --profile=py3");
///
/// // Unknown variables disappear silently.
/// assert_eq!(expand("a $NOPE b", &[]), "a  b");
/// ```
pub fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    shellexpand::env_with_context_no_errors(template, |name| {
        for (key, value) in vars {
            if *key == name {
                return Some(Cow::Borrowed(*value));
            }
        }
        // Absent variables expand to empty, never to the process env.
        Some(Cow::Borrowed(""))
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables() {
        let out = expand("foo $IDLIST bar", &[("IDLIST", "a b c")]);
        assert_eq!(out, "foo a b c bar");
    }

    #[test]
    fn expands_braced_form() {
        let out = expand("foo ${IDLIST}x", &[("IDLIST", "a")]);
        assert_eq!(out, "foo ax");
    }

    #[test]
    fn absent_variables_become_empty() {
        assert_eq!(expand("foo $MISSING bar", &[]), "foo  bar");
    }

    #[test]
    fn does_not_read_process_environment() {
        // PATH is always set in the environment; it must not leak in.
        assert_eq!(expand("$PATH", &[]), "");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(expand("no variables here", &[]), "no variables here");
    }
}
