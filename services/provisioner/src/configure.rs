//! VM spec configurators.
//!
//! Configurators run in registration order before the template's own spec
//! is merged in, so a template can override anything they set.

use mansion_throttle::HardwareSpec;

use crate::broker::VmSpec;
use crate::template::Template;

/// A hook that contributes to every VM spec.
pub trait Configurator: Send + Sync {
    /// Name used in error reports.
    fn name(&self) -> &str;

    fn configure(
        &self,
        template: &Template,
        hardware: &HardwareSpec,
        spec: &mut VmSpec,
    ) -> anyhow::Result<()>;
}

/// Installs an SSH daemon for the worker account.
pub struct SshdConfigurator {
    user: String,
    port: u16,
    public_key: String,
}

impl SshdConfigurator {
    /// Default worker account.
    pub const DEFAULT_USER: &'static str = "jenkins";

    /// Default sshd port inside the VM.
    pub const DEFAULT_PORT: u16 = 15000;

    pub fn new(user: impl Into<String>, port: u16, public_key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            port,
            public_key: public_key.into(),
        }
    }
}

impl Configurator for SshdConfigurator {
    fn name(&self) -> &str {
        "sshd"
    }

    fn configure(
        &self,
        _template: &Template,
        _hardware: &HardwareSpec,
        spec: &mut VmSpec,
    ) -> anyhow::Result<()> {
        let key = self.public_key.trim();
        if key.is_empty() {
            anyhow::bail!("no public key configured for {}", self.user);
        }
        spec.configs.insert(
            "sshd".to_string(),
            serde_json::json!({
                "user": self.user,
                "port": self.port,
                "authorized_key": key,
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{HardwareSize, TemplateCatalog};

    #[test]
    fn test_sshd_configurator() {
        let catalog =
            TemplateCatalog::from_json(r#"[{"id": "small", "mansion_type": "linux"}]"#).unwrap();
        let template = catalog.iter().next().unwrap();
        let mut spec = VmSpec::default();

        SshdConfigurator::new("jenkins", 15000, "ssh-rsa AAAA\n")
            .configure(template, &HardwareSize::Small.to_spec(), &mut spec)
            .unwrap();
        assert_eq!(spec.configs["sshd"]["authorized_key"], "ssh-rsa AAAA");
        assert_eq!(spec.configs["sshd"]["port"], 15000);

        let err = SshdConfigurator::new("jenkins", 15000, " ")
            .configure(template, &HardwareSize::Small.to_spec(), &mut spec)
            .unwrap_err();
        assert!(err.to_string().contains("no public key"));
    }
}
