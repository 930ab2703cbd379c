// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing-Key Parsing
//!
//! This module decodes dotted routing keys against a reference schema. A
//! reference names each positional component of a routing key; at most one
//! component may span multiple dot-separated words. Parsing a delivery's
//! routing key against the reference of its binding yields a map from
//! component name to decoded value.

use std::collections::HashMap;

use crate::errors::PulseError;

/// One named component of a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeyPart {
    pub(crate) name: String,
    pub(crate) multiple_words: bool,
}

/// An ordered schema describing the components of a dotted routing key.
///
/// This struct implements the builder pattern to assemble references. At most
/// one part may be marked as spanning multiple words; the parser rejects
/// references that declare more.
///
/// # Example
/// ```
/// use pulse::routing::RoutingKeyReference;
///
/// let reference = RoutingKeyReference::new()
///     .word("verb")
///     .word("object")
///     .multiple_words("remainder");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingKeyReference {
    pub(crate) parts: Vec<RoutingKeyPart>,
}

impl RoutingKeyReference {
    /// Creates an empty reference.
    ///
    /// # Returns
    /// A new reference with no parts
    pub fn new() -> RoutingKeyReference {
        RoutingKeyReference { parts: vec![] }
    }

    /// Appends a single-word part with the given name.
    ///
    /// # Parameters
    /// * `name` - The name the decoded value is stored under
    ///
    /// # Returns
    /// Self for method chaining
    pub fn word(mut self, name: &str) -> Self {
        self.parts.push(RoutingKeyPart {
            name: name.to_owned(),
            multiple_words: false,
        });
        self
    }

    /// Appends a part that may span zero or more dot-separated words.
    ///
    /// # Parameters
    /// * `name` - The name the decoded value is stored under
    ///
    /// # Returns
    /// Self for method chaining
    pub fn multiple_words(mut self, name: &str) -> Self {
        self.parts.push(RoutingKeyPart {
            name: name.to_owned(),
            multiple_words: true,
        });
        self
    }

    /// The parts of this reference, in routing-key order.
    pub fn parts(&self) -> &[RoutingKeyPart] {
        &self.parts
    }
}

/// Decodes a dotted routing key against a reference.
///
/// Single-word parts before the multi-word part consume words from the front
/// of the key; single-word parts after it consume words from the back. The
/// remaining middle words, dots included, become the multi-word value, which
/// may be empty. When the reference has no multi-word part, the key must have
/// exactly as many words as the reference has parts.
///
/// # Parameters
/// * `routing_key` - The dotted routing key of a delivery
/// * `reference` - The schema naming each component
///
/// # Returns
/// A map from part name to decoded value, or an error when the key does not
/// line up with the reference.
pub fn parse_routing_key(
    routing_key: &str,
    reference: &RoutingKeyReference,
) -> Result<HashMap<String, String>, PulseError> {
    let parts = reference.parts();
    if parts.iter().filter(|part| part.multiple_words).count() > 1 {
        return Err(PulseError::AmbiguousRoutingKeyReference);
    }

    let words: Vec<&str> = routing_key.split('.').collect();
    let mut routing = HashMap::new();

    let Some(multi) = parts.iter().position(|part| part.multiple_words) else {
        if words.len() != parts.len() {
            return Err(PulseError::RoutingKeyMismatch(routing_key.to_owned()));
        }
        for (part, word) in parts.iter().zip(&words) {
            routing.insert(part.name.clone(), (*word).to_owned());
        }
        return Ok(routing);
    };

    let trailing = parts.len() - multi - 1;
    if words.len() < multi + trailing {
        return Err(PulseError::RoutingKeyMismatch(routing_key.to_owned()));
    }

    for (part, word) in parts[..multi].iter().zip(&words[..multi]) {
        routing.insert(part.name.clone(), (*word).to_owned());
    }
    for (part, word) in parts[multi + 1..].iter().zip(&words[words.len() - trailing..]) {
        routing.insert(part.name.clone(), (*word).to_owned());
    }
    routing.insert(
        parts[multi].name.clone(),
        words[multi..words.len() - trailing].join("."),
    );

    Ok(routing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_reference() {
        let reference = RoutingKeyReference::new().word("verb").word("object");
        let routing = parse_routing_key("greetings.earthling", &reference).unwrap();

        assert_eq!(routing["verb"], "greetings");
        assert_eq!(routing["object"], "earthling");
    }

    #[test]
    fn parses_trailing_multi_word_part() {
        let reference = RoutingKeyReference::new()
            .word("verb")
            .word("object")
            .multiple_words("remainder");
        let routing =
            parse_routing_key("greetings.earthling.foo.bar.bing", &reference).unwrap();

        assert_eq!(routing["verb"], "greetings");
        assert_eq!(routing["object"], "earthling");
        assert_eq!(routing["remainder"], "foo.bar.bing");
    }

    #[test]
    fn parses_multi_word_part_in_the_middle() {
        let reference = RoutingKeyReference::new()
            .word("head")
            .multiple_words("middle")
            .word("tail");
        let routing = parse_routing_key("a.b.c.d.e", &reference).unwrap();

        assert_eq!(routing["head"], "a");
        assert_eq!(routing["middle"], "b.c.d");
        assert_eq!(routing["tail"], "e");
    }

    #[test]
    fn multi_word_part_may_be_empty() {
        let reference = RoutingKeyReference::new()
            .word("verb")
            .word("object")
            .multiple_words("remainder");
        let routing = parse_routing_key("greetings.earthling", &reference).unwrap();

        assert_eq!(routing["remainder"], "");
    }

    #[test]
    fn rejects_word_count_mismatch() {
        let reference = RoutingKeyReference::new().word("verb").word("object");

        assert_eq!(
            parse_routing_key("greetings.earthling.extra", &reference),
            Err(PulseError::RoutingKeyMismatch(
                "greetings.earthling.extra".to_owned()
            ))
        );
    }

    #[test]
    fn rejects_key_shorter_than_fixed_parts() {
        let reference = RoutingKeyReference::new()
            .word("verb")
            .multiple_words("middle")
            .word("tail");

        assert!(parse_routing_key("greetings", &reference).is_err());
    }

    #[test]
    fn rejects_two_multi_word_parts() {
        let reference = RoutingKeyReference::new()
            .multiple_words("one")
            .multiple_words("two");

        assert_eq!(
            parse_routing_key("a.b.c", &reference),
            Err(PulseError::AmbiguousRoutingKeyReference)
        );
    }

    #[test]
    fn joining_parsed_parts_restores_the_key() {
        let reference = RoutingKeyReference::new()
            .word("verb")
            .multiple_words("middle")
            .word("tail");
        let key = "greetings.foo.bar.bing.earthling";
        let routing = parse_routing_key(key, &reference).unwrap();

        let rebuilt: Vec<&str> = reference
            .parts()
            .iter()
            .map(|part| routing[&part.name].as_str())
            .collect();
        assert_eq!(rebuilt.join("."), key);
    }
}
