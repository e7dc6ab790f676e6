//! Regex rewrite of the outbound path and query.

use regex::Regex;

use crate::config::RewriteConfig;

/// A compiled `pattern` plus a `target` template with `$1`, `$2`, ... placeholders.
///
/// On a match the whole URI is replaced by the rendered template. Without a match the
/// URI passes through unchanged.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    target: String,
}

impl RewriteRule {
    pub fn new(conf: &RewriteConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&conf.pattern)?,
            target: conf.target.clone(),
        })
    }

    pub fn apply(&self, uri: &str) -> String {
        let Some(captures) = self.pattern.captures(uri) else {
            return uri.to_string();
        };

        let mut out = String::with_capacity(self.target.len() + uri.len());
        let mut rest = self.target.as_str();
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();

            // Longest group number that exists wins, so `$12` still renders `$1` followed by `2`
            // when there are fewer than twelve groups.
            let group = (1..=digits).rev().find_map(|len| {
                let index: usize = after[..len].parse().ok()?;
                (index >= 1 && index < captures.len()).then_some((index, len))
            });
            match group {
                Some((index, len)) => {
                    out.push_str(captures.get(index).map(|m| m.as_str()).unwrap_or(""));
                    rest = &after[len..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
