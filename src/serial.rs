//! Versionless field concatenation used for persisted metadata.
//!
//! Every field is written as `<byte length>_<text>`. Fields are read back by
//! position; fields past the ones a reader knows about are ignored, so
//! newer writers can append fields. Renumbering existing fields requires a
//! format change.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct Serializer {
    out: String,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, value: impl Display) -> Self {
        let text = value.to_string();
        self.out.push_str(&text.len().to_string());
        self.out.push('_');
        self.out.push_str(&text);
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[derive(Debug)]
pub struct Deserializer<'a> {
    rest: &'a str,
    position: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(serial: &'a str) -> Self {
        Self {
            rest: serial,
            position: 0,
        }
    }

    /// Reads the next raw field.
    pub fn next_field(&mut self) -> Result<&'a str> {
        let (len, tail) = self
            .rest
            .split_once('_')
            .ok_or_else(|| Error::metadata(format!("field {} is missing", self.position)))?;
        let len: usize = len
            .parse()
            .map_err(|_| Error::metadata(format!("field {} has a bad length `{len}`", self.position)))?;
        let value = tail.get(..len).ok_or_else(|| {
            Error::metadata(format!(
                "field {} declares {len} bytes but only {} remain",
                self.position,
                tail.len()
            ))
        })?;
        self.rest = &tail[len..];
        self.position += 1;
        Ok(value)
    }

    /// Reads the next field and parses it.
    pub fn parse<T>(&mut self) -> Result<T>
    where
        T: FromStr,
    {
        let position = self.position;
        let text = self.next_field()?;
        text.parse()
            .map_err(|_| Error::metadata(format!("field {position} cannot be parsed: `{text}`")))
    }

    pub fn parse_bool(&mut self) -> Result<bool> {
        match self.next_field()? {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(Error::metadata(format!("expected a flag, got `{other}`"))),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.rest.is_empty()
    }
}

pub fn flag(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fields_are_length_prefixed() {
        let s = Serializer::new().field("emp").field(3).field("").finish();
        assert_eq!(s, "3_emp1_30_");
        let mut d = Deserializer::new(&s);
        assert_eq!(d.next_field().unwrap(), "emp");
        assert_eq!(d.parse::<u32>().unwrap(), 3);
        assert_eq!(d.next_field().unwrap(), "");
        assert!(d.is_exhausted());
        assert!(d.next_field().is_err());
    }

    #[test]
    fn trailing_fields_are_ignored() {
        let s = Serializer::new().field("a").field("legacy").finish();
        let mut d = Deserializer::new(&s);
        assert_eq!(d.next_field().unwrap(), "a");
        assert!(!d.is_exhausted());
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut d = Deserializer::new("10_short");
        assert!(matches!(d.next_field(), Err(Error::MetadataConsistency { .. })));
    }

    proptest! {
        #[test]
        fn any_text_survives(fields in proptest::collection::vec(".*", 0..5)) {
            let s = fields.iter().fold(Serializer::new(), |s, f| s.field(f)).finish();
            let mut d = Deserializer::new(&s);
            for f in &fields {
                prop_assert_eq!(d.next_field().unwrap(), f.as_str());
            }
            prop_assert!(d.is_exhausted());
        }
    }
}
