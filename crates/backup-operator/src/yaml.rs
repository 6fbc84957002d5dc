//! Utility functions for processing data in the YAML file format
use std::{io::Write, path::Path};

use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents every error which can be encountered during YAML serialization.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to write YAML document separator"))]
    WriteDocumentSeparator { source: std::io::Error },

    #[snafu(display("failed to write YAML to file"))]
    WriteToFile { source: std::io::Error },

    #[snafu(display("failed to write YAML to stdout"))]
    WriteToStdout { source: std::io::Error },

    #[snafu(display("failed to parse bytes as valid UTF-8 string"))]
    ParseUtf8Bytes { source: std::string::FromUtf8Error },
}

/// Provides configurable options during YAML serialization.
///
/// For most people the default implementation [`SerializeOptions::default()`] is sufficient as it
/// enables explicit document and singleton map serialization.
pub struct SerializeOptions {
    /// Adds leading triple dashes (`---`) to the output string.
    pub explicit_document: bool,

    /// Serialize enum variants as YAML maps using the variant name as the key.
    pub singleton_map: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            explicit_document: true,
            singleton_map: true,
        }
    }
}

/// Serializes any type `T` which is [serializable](serde::Serialize) as YAML using the provided
/// [`SerializeOptions`].
pub trait YamlSchema: Sized + serde::Serialize {
    /// Generates the YAML schema of `self` using the provided [`SerializeOptions`].
    fn generate_yaml_schema(&self, options: SerializeOptions) -> Result<String> {
        let mut buffer = Vec::new();

        serialize(&self, &mut buffer, options)?;

        String::from_utf8(buffer).context(ParseUtf8BytesSnafu)
    }

    /// Generates and writes the YAML schema of `self` to a file at `path`.
    fn write_yaml_schema<P: AsRef<Path>>(&self, path: P, options: SerializeOptions) -> Result<()> {
        let schema = self.generate_yaml_schema(options)?;
        std::fs::write(path, schema).context(WriteToFileSnafu)
    }

    /// Generates and prints the YAML schema of `self` to stdout.
    fn print_yaml_schema(&self, options: SerializeOptions) -> Result<()> {
        let schema = self.generate_yaml_schema(options)?;

        let mut writer = std::io::stdout();
        writer
            .write_all(schema.as_bytes())
            .context(WriteToStdoutSnafu)
    }
}

impl<T> YamlSchema for T where T: serde::ser::Serialize {}

/// Serializes the given data structure and writes it to a [`Writer`](Write).
pub fn serialize<T, W>(value: &T, mut writer: W, options: SerializeOptions) -> Result<()>
where
    T: serde::Serialize,
    W: std::io::Write,
{
    if options.explicit_document {
        writer
            .write_all(b"---\n")
            .context(WriteDocumentSeparatorSnafu)?;
    }

    let mut serializer = serde_yaml::Serializer::new(writer);

    if options.singleton_map {
        serde_yaml::with::singleton_map_recursive::serialize(value, &mut serializer)
            .context(SerializeYamlSnafu)?;
    } else {
        value
            .serialize(&mut serializer)
            .context(SerializeYamlSnafu)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn explicit_document_prefix() {
        let value = BTreeMap::from([("schedule", "daily")]);

        let yaml = value
            .generate_yaml_schema(SerializeOptions::default())
            .unwrap();
        assert_eq!(yaml, "---\nschedule: daily\n");

        let yaml = value
            .generate_yaml_schema(SerializeOptions {
                explicit_document: false,
                singleton_map: false,
            })
            .unwrap();
        assert_eq!(yaml, "schedule: daily\n");
    }

    #[test]
    fn write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yaml");

        BTreeMap::from([("a", 1)])
            .write_yaml_schema(&path, SerializeOptions::default())
            .unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "---\na: 1\n");
    }
}
