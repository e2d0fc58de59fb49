//! Text form of path-permission profiles, parsed with `nom`.
//!
//! One rule per line, `#` starts a comment:
//!
//! ```text
//! # application data
//! /srv/app/data/** rwa,
//! "/srv/app/static files/*" r
//! ```
//!
//! The trailing comma is optional. Patterns containing spaces are quoted.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::{char, not_line_ending, space0, space1},
    combinator::{all_consuming, opt, value},
    sequence::{delimited, preceded, terminated},
};
use syswarden_common::error::{Result, SyswardenError};

use crate::paths::{PathPermissionProfile, PathRule, PermissionSet};

fn comment(input: &str) -> IResult<&str, ()> {
    value((), preceded(char('#'), not_line_ending)).parse(input)
}

fn pattern(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), is_not("\""), char('"')),
        take_while1(|c: char| !c.is_whitespace() && c != '#'),
    ))
    .parse(input)
}

fn permissions(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphabetic()).parse(input)
}

/// `pattern perms[,]`
fn rule(input: &str) -> IResult<&str, (&str, &str)> {
    (
        terminated(pattern, space1),
        terminated(permissions, (space0, opt(char(',')))),
    )
        .parse(input)
}

/// A full line: blank, comment only, or a rule with an optional comment.
fn line(input: &str) -> IResult<&str, Option<(&str, &str)>> {
    all_consuming(delimited(space0, opt(rule), (space0, opt(comment)))).parse(input)
}

/// Parses the text form.
///
/// # Errors
///
/// Returns `Parse` with the offending line number on syntax errors, unknown
/// permission letters or relative patterns.
pub fn parse_text(input: &str) -> Result<PathPermissionProfile> {
    let mut rules = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let lineno = idx + 1;
        let at_line = |message: String| SyswardenError::Parse {
            what: "path profile",
            message: format!("line {lineno}: {message}"),
        };
        let (_, parsed) =
            line(raw).map_err(|e| at_line(format!("invalid rule '{}': {e}", raw.trim())))?;
        if let Some((pat, perms)) = parsed {
            let permissions: PermissionSet = perms
                .parse()
                .map_err(|e: SyswardenError| at_line(e.to_string()))?;
            rules.push(PathRule::new(pat, permissions).map_err(|e| at_line(e.to_string()))?);
        }
    }
    tracing::debug!(rules = rules.len(), "parsed path profile");
    Ok(PathPermissionProfile::new(rules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_comments_and_blank_lines() {
        let input = "\
# data directory
/srv/app/data/** rwa,

  /srv/app/bin/server rx   # the binary
\"/srv/app/static files/*\" r
";
        let profile = parse_text(input).unwrap();
        assert_eq!(profile.rules.len(), 3);
        assert_eq!(profile.rules[0].pattern, "/srv/app/data/**");
        assert_eq!(profile.rules[0].permissions.to_string(), "rwa");
        assert_eq!(profile.rules[1].permissions.to_string(), "rx");
        assert_eq!(profile.rules[2].pattern, "/srv/app/static files/*");
    }

    #[test]
    fn comma_is_optional() {
        let with = parse_text("/tmp/a r,").unwrap();
        let without = parse_text("/tmp/a r").unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn errors_report_line_number() {
        let err = parse_text("/srv/app r\n/srv/app/x rq\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");

        let err = parse_text("/srv/app\n").unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");
    }

    #[test]
    fn relative_pattern_is_rejected() {
        assert!(parse_text("srv/app r").is_err());
    }

    #[test]
    fn text_form_is_detected_by_profile_parse() {
        let profile = PathPermissionProfile::parse("/srv/app/** r\n").unwrap();
        assert_eq!(profile.rules.len(), 1);
    }
}
