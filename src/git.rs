//! Integração com Git via libgit2 para o commit embutido da capacidade `publish`.
//!
//! O [`GitManager`] encapsula o stage da árvore de trabalho e o commit do
//! resultado de um item ou do resumo final.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature};
use std::path::Path;

/// Arquivos nunca adicionados ao stage, para evitar exposição acidental de segredos.
const EXCLUDED_FILES: &[&str] = &[".env", ".env.local"];

/// Gerenciador de operações Git usando a biblioteca libgit2.
pub struct GitManager {
    repo: Repository,
    excluded_dirs: Vec<String>,
}

impl GitManager {
    /// Abre um repositório git existente no caminho fornecido.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path).context("failed to open git repository")?;
        Ok(Self {
            repo,
            excluded_dirs: Vec::new(),
        })
    }

    /// Exclui um diretório (relativo à raiz do repositório) do staging.
    pub fn exclude_dir(mut self, dir: &str) -> Self {
        self.excluded_dirs.push(dir.trim_end_matches('/').to_string());
        self
    }

    /// Adiciona todas as alterações ao stage e cria um commit, retornando o hash curto.
    ///
    /// Arquivos sensíveis (.env, .env.local, *.key) e os diretórios excluídos
    /// ficam fora do staging. Quando a árvore resultante é igual à do HEAD nenhum
    /// commit novo é criado e o hash do HEAD é devolvido.
    pub fn commit(&self, message: &str) -> Result<String> {
        let excluded_dirs = &self.excluded_dirs;
        let mut index = self.repo.index()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let in_excluded_dir = excluded_dirs.iter().any(|d| path.starts_with(d));
                if in_excluded_dir || EXCLUDED_FILES.contains(&name) || name.ends_with(".key") {
                    1 // pular
                } else {
                    0 // adicionar
                }
            }),
        )?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_oid {
                return Ok(short_hash(&parent.id()));
            }
        }

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("gatework", "gatework@localhost"))?;

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        Ok(short_hash(&commit_oid))
    }

    /// Cria um commit resumindo o trabalho de um item, retornando o hash curto.
    ///
    /// Formato da mensagem de commit: `gatework: [categoria] título (id)`
    pub fn commit_item(&self, item_id: &str, title: &str, category: &str) -> Result<String> {
        let category = if category.is_empty() { "feature" } else { category };
        let message = format!("gatework: [{category}] {title} ({item_id})");
        self.commit(&message)
    }
}

fn short_hash(oid: &git2::Oid) -> String {
    oid.to_string()[..7].to_string()
}
