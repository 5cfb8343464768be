//! Configuração do gatework carregada a partir de `gatework.toml`.
//!
//! A struct [`GateworkConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::capability::Capability;
use crate::state_machine::RetryConfig;

const CONFIG_FILE: &str = "gatework.toml";

/// Configuração de nível superior carregada de `gatework.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GateworkConfig {
    /// Teto de retentativas compartilhado por todos os loops limitados.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial (0 desliga a espera).
    #[serde(default)]
    pub base_delay_ms: u64,

    /// Quantos itens já concluídos são reverificados junto com o item novo (1 ou 2).
    #[serde(default = "default_regression_sample")]
    pub regression_sample: usize,

    /// Limite de itens processados por sessão; sem limite quando ausente.
    #[serde(default)]
    pub max_items_per_session: Option<u32>,

    /// Diretório onde ficam os documentos persistidos da sessão.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Tempo máximo de uma invocação de executor, em segundos.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Comandos externos por capacidade.
    #[serde(default)]
    pub executors: ExecutorsConfig,
}

/// Comandos de shell que atendem cada capacidade.
///
/// `publish` sem comando usa o commit embutido via git; `notify` sem comando usa
/// `webhook_url` quando presente.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorsConfig {
    pub implement: Option<String>,
    pub verify: Option<String>,
    pub review: Option<String>,
    pub track: Option<String>,
    pub publish: Option<String>,
    pub notify: Option<String>,
    /// Procedimento idempotente que sobe o ambiente antes da primeira verificação.
    pub bootstrap: Option<String>,
    pub webhook_url: Option<String>,
}

impl ExecutorsConfig {
    pub fn command_for(&self, capability: Capability) -> Option<&str> {
        let cmd = match capability {
            Capability::Implement => &self.implement,
            Capability::Verify => &self.verify,
            Capability::Review => &self.review,
            Capability::Track => &self.track,
            Capability::Publish => &self.publish,
            Capability::Notify => &self.notify,
        };
        cmd.as_deref().filter(|c| !c.trim().is_empty())
    }
}

// Valor padrão para retentativas máximas: 2.
fn default_max_retries() -> u32 {
    2
}

// Valor padrão para a amostra de regressão: 2 itens.
fn default_regression_sample() -> usize {
    2
}

// Valor padrão para o diretório de estado: ".gatework".
fn default_state_dir() -> PathBuf {
    PathBuf::from(".gatework")
}

// Valor padrão para o timeout de comandos: 30 minutos.
fn default_command_timeout_secs() -> u64 {
    1800
}

impl Default for GateworkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: 0,
            regression_sample: default_regression_sample(),
            max_items_per_session: None,
            state_dir: default_state_dir(),
            command_timeout_secs: default_command_timeout_secs(),
            executors: ExecutorsConfig::default(),
        }
    }
}

impl GateworkConfig {
    /// Carrega a configuração de `gatework.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Carrega a configuração de um caminho explícito, que precisa existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<GateworkConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    /// Tamanho da amostra de regressão, restrito a 1..=2.
    pub fn sample_size(&self) -> usize {
        self.regression_sample.clamp(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = GateworkConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay_ms, 0);
        assert_eq!(config.sample_size(), 2);
        assert_eq!(config.state_dir, PathBuf::from(".gatework"));
        assert!(config.max_items_per_session.is_none());
        assert!(config.executors.command_for(Capability::Implement).is_none());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_retries = 3
            regression_sample = 7

            [executors]
            implement = "./agents/implement.sh"
            verify = "  "
            webhook_url = "https://hooks.example.com/T0"
        "#;
        let config: GateworkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sample_size(), 2);
        assert_eq!(config.command_timeout_secs, 1800);
        assert_eq!(
            config.executors.command_for(Capability::Implement),
            Some("./agents/implement.sh")
        );
        assert!(config.executors.command_for(Capability::Verify).is_none());
        assert_eq!(
            config.executors.webhook_url.as_deref(),
            Some("https://hooks.example.com/T0")
        );
    }

    #[test]
    fn retry_config_follows_file() {
        let config: GateworkConfig = toml::from_str("max_retries = 1\nbase_delay_ms = 250").unwrap();
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.delay_for_attempt(2), 500);
    }

    #[test]
    fn load_from_missing_path_fails() {
        assert!(GateworkConfig::load_from(Path::new("/definitely/not/gatework.toml")).is_err());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("gatework.toml");
        std::fs::write(&path, "state_dir = \"state\"\nmax_items_per_session = 3\n").unwrap();
        let config = GateworkConfig::load_from(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("state"));
        assert_eq!(config.max_items_per_session, Some(3));
    }
}
