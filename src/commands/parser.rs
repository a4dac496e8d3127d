// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Slash-command tokenizer.
//!
//! Whitespace-separated tokens with double- and single-quoted runs: quotes
//! are stripped, their contents kept verbatim, and an empty pair yields an
//! empty-string argument.

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// Command name without the leading slash.
    pub name: String,
    pub args: Vec<String>,
}

/// Parse a message as a slash command. Returns `None` for anything that
/// does not start with `/` followed by a name.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut tokens = tokenize(trimmed);
    if tokens.is_empty() {
        return None;
    }
    let first = tokens.remove(0);
    let name = first.strip_prefix('/')?.to_string();
    if name.is_empty() {
        return None;
    }

    Some(ParsedCommand { name, args: tokens })
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut has_token = false;

    for c in input.chars() {
        match in_quote {
            Some(quote) => {
                if c == quote {
                    in_quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    in_quote = Some(c);
                    has_token = true;
                }
                c if c.is_whitespace() => {
                    if has_token {
                        tokens.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            },
        }
    }
    if has_token {
        tokens.push(current);
    }

    tokens
}
