//! Password generation from regex-shaped rules.
//!
//! A rule is a regular expression pattern; generation walks the parsed
//! pattern and samples one matching string using the operating system's
//! CSPRNG. Only patterns that describe a bounded language are accepted:
//! unbounded repetition (`*`, `+`, open-ended `{n,}`) and zero-width
//! assertions are rejected when the generator is built.

use crate::config::Config;
use crate::{PkvaultError, Result};
use rand::rngs::OsRng;
use rand::Rng;
use regex_syntax::hir::{Class, Hir, HirKind};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Samples passwords matching named regex rules.
///
/// # Example
///
/// ```
/// use pkvault::{Config, Generator};
///
/// let config = Config::new("alice").with_rule("pin", "[0-9]{6}");
/// let generator = Generator::new(&config).unwrap();
/// let pin = generator.generate(Some("pin")).unwrap();
/// assert_eq!(pin.len(), 6);
/// ```
pub struct Generator {
    rules: HashMap<String, Hir>,
    default_rule: String,
    max_len: usize,
}

impl Generator {
    /// Parses and validates every rule in the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Pattern`] if any rule fails to parse or
    /// describes an unbounded or unsupported pattern.
    pub fn new(config: &Config) -> Result<Self> {
        let mut rules = HashMap::new();
        for (name, pattern) in &config.rules {
            let hir = regex_syntax::parse(pattern).map_err(|e| {
                PkvaultError::Pattern(format!("rule '{}' does not parse: {}", name, e))
            })?;
            check_bounded(&hir)
                .map_err(|reason| PkvaultError::Pattern(format!("rule '{}': {}", name, reason)))?;
            rules.insert(name.clone(), hir);
        }
        Ok(Self {
            rules,
            default_rule: config.default_rule.clone(),
            max_len: config.max_generated_len,
        })
    }

    /// Generates one password from the named rule, or from the default rule
    /// when `rule` is `None`.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::UnknownPattern`]: no rule by that name is configured
    /// - [`PkvaultError::Pattern`]: the sampled string exceeds the length cap
    pub fn generate(&self, rule: Option<&str>) -> Result<Zeroizing<String>> {
        let name = rule.unwrap_or(&self.default_rule);
        let hir = self.rules.get(name).ok_or_else(|| {
            PkvaultError::UnknownPattern(format!("no generation rule named '{}'", name))
        })?;

        let mut out = Zeroizing::new(String::new());
        sample(hir, &mut OsRng, &mut out)?;
        if out.chars().count() > self.max_len {
            return Err(PkvaultError::Pattern(format!(
                "rule '{}' produced {} characters, above the cap of {}",
                name,
                out.chars().count(),
                self.max_len
            )));
        }
        Ok(out)
    }

    /// Names of the configured rules.
    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("default_rule", &self.default_rule)
            .field("max_len", &self.max_len)
            .finish()
    }
}

/// Rejects patterns whose match language is unbounded or that use
/// constructs with no generative meaning.
fn check_bounded(hir: &Hir) -> std::result::Result<(), String> {
    match hir.kind() {
        HirKind::Empty | HirKind::Literal(_) => Ok(()),
        HirKind::Class(class) => {
            let empty = match class {
                Class::Unicode(c) => c.ranges().is_empty(),
                Class::Bytes(c) => c.ranges().is_empty(),
            };
            if empty {
                Err("character class matches nothing".to_string())
            } else {
                Ok(())
            }
        }
        HirKind::Look(_) => {
            Err("anchors and look-around have no generative meaning".to_string())
        }
        HirKind::Repetition(rep) => {
            if rep.max.is_none() {
                return Err("unbounded repetition ('*', '+', '{n,}')".to_string());
            }
            check_bounded(&rep.sub)
        }
        HirKind::Capture(cap) => check_bounded(&cap.sub),
        HirKind::Concat(parts) | HirKind::Alternation(parts) => {
            parts.iter().try_for_each(check_bounded)
        }
    }
}

fn sample(hir: &Hir, rng: &mut OsRng, out: &mut String) -> Result<()> {
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => Ok(()),
        HirKind::Literal(lit) => {
            let text = std::str::from_utf8(&lit.0)
                .map_err(|_| PkvaultError::Pattern("non-UTF-8 literal".to_string()))?;
            out.push_str(text);
            Ok(())
        }
        HirKind::Class(class) => {
            out.push(sample_class(class, rng)?);
            Ok(())
        }
        HirKind::Repetition(rep) => {
            // check_bounded guarantees max is present.
            let max = rep.max.ok_or_else(|| {
                PkvaultError::Pattern("unbounded repetition".to_string())
            })?;
            let count = rng.gen_range(rep.min..=max);
            for _ in 0..count {
                sample(&rep.sub, rng, out)?;
            }
            Ok(())
        }
        HirKind::Capture(cap) => sample(&cap.sub, rng, out),
        HirKind::Concat(parts) => {
            for part in parts {
                sample(part, rng, out)?;
            }
            Ok(())
        }
        HirKind::Alternation(parts) => {
            let pick = rng.gen_range(0..parts.len());
            sample(&parts[pick], rng, out)
        }
    }
}

/// Picks one character from a class, uniformly across all members.
fn sample_class(class: &Class, rng: &mut OsRng) -> Result<char> {
    match class {
        Class::Unicode(c) => {
            let total: u64 = c
                .ranges()
                .iter()
                .map(|r| u64::from(r.end() as u32 - r.start() as u32) + 1)
                .sum();
            let mut pick = rng.gen_range(0..total);
            for range in c.ranges() {
                let span = u64::from(range.end() as u32 - range.start() as u32) + 1;
                if pick < span {
                    let code = range.start() as u32 + pick as u32;
                    return char::from_u32(code).ok_or_else(|| {
                        PkvaultError::Pattern("class range crosses surrogates".to_string())
                    });
                }
                pick -= span;
            }
            Err(PkvaultError::Pattern("empty character class".to_string()))
        }
        Class::Bytes(c) => {
            let total: u32 = c
                .ranges()
                .iter()
                .map(|r| u32::from(r.end() - r.start()) + 1)
                .sum();
            let mut pick = rng.gen_range(0..total);
            for range in c.ranges() {
                let span = u32::from(range.end() - range.start()) + 1;
                if pick < span {
                    return Ok((range.start() + pick as u8) as char);
                }
                pick -= span;
            }
            Err(PkvaultError::Pattern("empty character class".to_string()))
        }
    }
}
