//! YAML output of the `CustomResourceDefinition`, used by the `crd` subcommand.
use std::{io::Write, path::Path};

use serde::Serialize;
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to write YAML to file"))]
    WriteToFile { source: std::io::Error },

    #[snafu(display("failed to write YAML to stdout"))]
    WriteToStdout { source: std::io::Error },
}

/// Provides YAML schema output for Kubernetes custom resources.
pub trait CustomResourceExt: kube::CustomResourceExt {
    /// Generates the `CustomResourceDefinition` as an explicit YAML document (leading `---`).
    fn yaml_schema() -> Result<Vec<u8>> {
        let mut buffer = b"---\n".to_vec();
        serialize(&Self::crd(), &mut buffer)?;
        Ok(buffer)
    }

    /// Writes the `CustomResourceDefinition` to the file at `path`.
    fn write_yaml_schema<P: AsRef<Path>>(path: P) -> Result<()> {
        std::fs::write(path, Self::yaml_schema()?).context(WriteToFileSnafu)
    }

    /// Prints the `CustomResourceDefinition` to [stdout].
    ///
    /// [stdout]: std::io::stdout
    fn print_yaml_schema() -> Result<()> {
        std::io::stdout()
            .write_all(&Self::yaml_schema()?)
            .context(WriteToStdoutSnafu)
    }
}

impl<T> CustomResourceExt for T where T: kube::CustomResourceExt {}

fn serialize<T, W>(value: &T, writer: W) -> Result<()>
where
    T: Serialize,
    W: Write,
{
    let mut serializer = serde_yaml::Serializer::new(writer);
    serde_yaml::with::singleton_map_recursive::serialize(value, &mut serializer)
        .context(SerializeYamlSnafu)
}
