//! Print the `SecretAgentConfiguration` CustomResourceDefinition as YAML
//!
//! ```sh
//! cargo run --bin crdgen > config/crd/bases/secret-agent.secrets.forgerock.io_secretagentconfigurations.yaml
//! ```

use kube::CustomResourceExt;
use secret_agent::crd::SecretAgentConfiguration;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&SecretAgentConfiguration::crd())?);
    Ok(())
}
