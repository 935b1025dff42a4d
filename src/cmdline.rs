//! Command-line contributions and secondary validation.
//!
//! Full command-line parsing belongs to the process front end, not to this
//! crate. What lives here is the part the loader owns: modules contribute
//! option descriptors during `load_components`, and the collected set is
//! used for a validity-only second pass over the options the front end could
//! not interpret.

use crate::config::Section;
use crate::error::{Error, ErrorKind, Result};

// ---------------------------------------------------------------------------
// Option descriptors
// ---------------------------------------------------------------------------

/// One long option contributed by a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionDescriptor {
    /// Long option name, without the leading dashes.
    pub long: String,
    /// True if the option consumes a value (`--opt=v` or `--opt v`).
    pub takes_value: bool,
    /// Help text shown with the full help listing.
    pub help: String,
}

impl OptionDescriptor {
    /// A boolean flag.
    #[must_use]
    pub fn flag(long: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            long: long.into(),
            takes_value: false,
            help: help.into(),
        }
    }

    /// An option carrying a value.
    #[must_use]
    pub fn with_value(long: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            long: long.into(),
            takes_value: true,
            help: help.into(),
        }
    }
}

/// The merged option set collected while loading modules.
#[derive(Clone, Debug, Default)]
pub struct OptionSet {
    options: Vec<OptionDescriptor>,
}

impl OptionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one descriptor; a duplicate long name keeps the first.
    pub fn add(&mut self, descriptor: OptionDescriptor) {
        if !self.contains(&descriptor.long) {
            self.options.push(descriptor);
        }
    }

    /// Merges another set into this one.
    pub fn merge(&mut self, other: OptionSet) {
        for descriptor in other.options {
            self.add(descriptor);
        }
    }

    /// Returns true if the long name is registered.
    #[must_use]
    pub fn contains(&self, long: &str) -> bool {
        self.options.iter().any(|d| d.long == long)
    }

    /// Looks up a descriptor by long name.
    #[must_use]
    pub fn get(&self, long: &str) -> Option<&OptionDescriptor> {
        self.options.iter().find(|d| d.long == long)
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Returns true if no descriptors were contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Renders the option listing the way the full-help path prints it.
    #[must_use]
    pub fn help_text(&self) -> String {
        let mut out = String::new();
        for descriptor in &self.options {
            let value = if descriptor.takes_value { " <value>" } else { "" };
            out.push_str(&format!(
                "  --{}{}\n      {}\n",
                descriptor.long, value, descriptor.help
            ));
        }
        out
    }

    /// Validity-only pass over already-tokenized arguments.
    ///
    /// Returns the tokens no registered option accounts for. With
    /// `allow_unknown` false, the first unknown option is an error instead.
    pub fn validate(&self, tokens: &[String], allow_unknown: bool) -> Result<Vec<String>> {
        let mut unknown = Vec::new();
        let mut iter = tokens.iter();
        while let Some(token) = iter.next() {
            let Some(stripped) = token.strip_prefix("--") else {
                // positional argument; not ours to judge
                continue;
            };
            let name = stripped.split_once('=').map_or(stripped, |(n, _)| n);
            match self.get(name) {
                Some(descriptor) => {
                    if descriptor.takes_value && !stripped.contains('=') {
                        // value in the next token
                        iter.next();
                    }
                }
                None if allow_unknown => unknown.push(token.clone()),
                None => {
                    return Err(Error::new(ErrorKind::CommandLineOptionError)
                        .with_context(format!("unrecognized option: {token}")));
                }
            }
        }
        Ok(unknown)
    }
}

// ---------------------------------------------------------------------------
// Tokenizing helpers
// ---------------------------------------------------------------------------

/// Splits a command line on whitespace, honoring single and double quotes.
#[must_use]
pub fn tokenize(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in cmdline.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Quotes a token for round-tripping through a config entry.
#[must_use]
pub fn enquote(token: &str) -> String {
    if token.contains(char::is_whitespace) {
        format!("'{token}'")
    } else {
        token.to_string()
    }
}

/// Expands the `\n` escapes the help banner is stored with.
#[must_use]
pub fn decode_escapes(text: &str) -> String {
    text.replace("\\n", "\n")
}

// ---------------------------------------------------------------------------
// Secondary processing
// ---------------------------------------------------------------------------

/// What the secondary command-line pass decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecondaryOutcome {
    /// Nothing to do; bootstrap continues.
    Continue,
    /// Help was printed or `--exit` was given; bootstrap should stop early.
    ExitRequested,
}

/// Secondary command-line processing after module options were collected.
///
/// Re-validates the options the front end could not interpret, handles the
/// full-help request (only a case-insensitive prefix of `full` is accepted),
/// and recognizes an early `--exit` request.
pub fn process_secondary(config: &mut Section, options: &OptionSet) -> Result<SecondaryOutcome> {
    let unknown_cmd_line = config.get_or("runtime.unknown_cmd_line", "").to_string();
    if !unknown_cmd_line.is_empty() {
        let runtime_mode = config.get_or("runtime.mode", "");
        tracing::debug!(runtime_mode, "re-validating uninterpreted options");
        let allow_unknown = config.get_or("runtime.commandline.allow_unknown", "0") != "0";
        let tokens = tokenize(&unknown_cmd_line);
        // token 0 is the program name
        let rest = tokens.get(1..).unwrap_or(&[]);
        let still_unknown = options.validate(rest, allow_unknown)?;
        if !still_unknown.is_empty() {
            let joined = still_unknown
                .iter()
                .map(|t| enquote(t))
                .collect::<Vec<_>>()
                .join(" ");
            config.set("runtime.unknown_cmd_line_option", joined);
        }
    }

    let fullhelp = config.get_or("runtime.cmd_line_help", "").to_string();
    if !fullhelp.is_empty() {
        let help_option = config.get_or("runtime.cmd_line_help_option", "").to_string();
        if "full".starts_with(&help_option.to_ascii_lowercase()) {
            println!("{}", decode_escapes(&fullhelp));
            println!("{}", options.help_text());
            return Ok(SecondaryOutcome::ExitRequested);
        }
        return Err(Error::new(ErrorKind::CommandLineOptionError)
            .with_context(format!("unknown help option: {help_option}")));
    }

    let cmd_line = config.get_or("runtime.cmd_line", "").to_string();
    if !cmd_line.is_empty() {
        let tokens = tokenize(&cmd_line);
        let rest = tokens.get(1..).unwrap_or(&[]);
        // everything unregistered is tolerated on this pass
        let _ = options.validate(rest, true)?;
        if tokens.iter().any(|t| t == "--print-bind") {
            let os_threads = config.get_or("runtime.os_threads", "1");
            tracing::info!(os_threads, "thread binding report requested");
        }
        if tokens.iter().any(|t| t == "--exit") {
            return Ok(SecondaryOutcome::ExitRequested);
        }
    }

    Ok(SecondaryOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(descriptors: Vec<OptionDescriptor>) -> OptionSet {
        let mut set = OptionSet::new();
        for d in descriptors {
            set.add(d);
        }
        set
    }

    #[test]
    fn tokenizer_honors_quotes() {
        let tokens = tokenize("app --mode 'round robin' --level=3");
        assert_eq!(tokens, vec!["app", "--mode", "round robin", "--level=3"]);
    }

    #[test]
    fn merge_keeps_first_duplicate() {
        let mut set = set_of(vec![OptionDescriptor::flag("verbose", "first")]);
        set.merge(set_of(vec![
            OptionDescriptor::flag("verbose", "second"),
            OptionDescriptor::with_value("level", "log level"),
        ]));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("verbose").expect("present").help, "first");
    }

    #[test]
    fn validate_consumes_option_values() {
        let set = set_of(vec![OptionDescriptor::with_value("level", "log level")]);
        let tokens: Vec<String> = vec!["--level".into(), "3".into(), "--level=4".into()];
        let unknown = set.validate(&tokens, false).expect("all known");
        assert!(unknown.is_empty());
    }

    #[test]
    fn validate_rejects_unknown_when_strict() {
        let set = set_of(vec![OptionDescriptor::flag("verbose", "chatty")]);
        let tokens: Vec<String> = vec!["--frob".into()];
        let err = set.validate(&tokens, false).expect_err("must reject");
        assert_eq!(err.kind(), ErrorKind::CommandLineOptionError);
    }

    #[test]
    fn secondary_records_still_unknown_options() {
        let mut config = Section::new("root");
        config.set("runtime.unknown_cmd_line", "app --frob --verbose");
        config.set("runtime.commandline.allow_unknown", "1");
        let options = set_of(vec![OptionDescriptor::flag("verbose", "chatty")]);

        let outcome = process_secondary(&mut config, &options).expect("processing");
        assert_eq!(outcome, SecondaryOutcome::Continue);
        assert_eq!(
            config.get("runtime.unknown_cmd_line_option"),
            Some("--frob")
        );
    }

    #[test]
    fn help_accepts_prefixes_of_full() {
        for prefix in ["", "f", "FU", "full"] {
            let mut config = Section::new("root");
            config.set("runtime.cmd_line_help", "usage: app\\n");
            config.set("runtime.cmd_line_help_option", prefix);
            let outcome =
                process_secondary(&mut config, &OptionSet::new()).expect("help must succeed");
            assert_eq!(outcome, SecondaryOutcome::ExitRequested);
        }
    }

    #[test]
    fn help_rejects_other_values() {
        let mut config = Section::new("root");
        config.set("runtime.cmd_line_help", "usage: app\\n");
        config.set("runtime.cmd_line_help_option", "fullest");
        let err = process_secondary(&mut config, &OptionSet::new()).expect_err("must reject");
        assert_eq!(err.kind(), ErrorKind::CommandLineOptionError);
    }

    #[test]
    fn exit_request_is_recognized() {
        let mut config = Section::new("root");
        config.set("runtime.cmd_line", "app --exit");
        let outcome = process_secondary(&mut config, &OptionSet::new()).expect("processing");
        assert_eq!(outcome, SecondaryOutcome::ExitRequested);
    }
}
