//! The `BackupPolicy` custom resource and helpers to print and install its definition.
use std::path::Path;

use snafu::{ResultExt, Snafu};

use crate::yaml::{self, SerializeOptions, YamlSchema};

pub mod backup_policy;
pub mod maintainer;

pub use backup_policy::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to write CRD YAML schema to file"))]
    WriteToFile { source: yaml::Error },

    #[snafu(display("failed to write CRD YAML schema to stdout"))]
    WriteToStdout { source: yaml::Error },

    #[snafu(display("failed to generate CRD YAML schema"))]
    GenerateSchema { source: yaml::Error },
}

/// Provides YAML schema generation and output capabilities for Kubernetes custom resources.
///
/// All output is an explicit YAML document with leading dashes (`---`).
pub trait CustomResourceExt: kube::CustomResourceExt {
    /// Generates the YAML schema of a `CustomResourceDefinition` and writes it to the specified
    /// file at `path`.
    fn write_yaml_schema<P: AsRef<Path>>(path: P) -> Result<()> {
        Self::crd()
            .write_yaml_schema(path, SerializeOptions::default())
            .context(WriteToFileSnafu)
    }

    /// Generates the YAML schema of a `CustomResourceDefinition` and prints it to [stdout].
    ///
    /// [stdout]: std::io::stdout
    fn print_yaml_schema() -> Result<()> {
        Self::crd()
            .print_yaml_schema(SerializeOptions::default())
            .context(WriteToStdoutSnafu)
    }

    /// Generates the YAML schema of a `CustomResourceDefinition` and returns it as a [`String`].
    fn yaml_schema() -> Result<String> {
        Self::crd()
            .generate_yaml_schema(SerializeOptions::default())
            .context(GenerateSchemaSnafu)
    }
}

impl<T> CustomResourceExt for T where T: kube::CustomResourceExt {}
