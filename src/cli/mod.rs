//! Command-line interface.
//!
//! Two subcommands: `research` answers one question about an indexed
//! repository; `map` runs the code mapper over a scope and writes its
//! document set. Provider wiring (store, embedder, LLM) happens here so the
//! library stays free of environment concerns.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::config::{Algorithm, Comprehensiveness, MapperConfig, ResearchConfig};
use crate::embedding::{EmbeddingProvider, HashEmbedder};
use crate::error::Error;
use crate::llm::{LlmProvider, OpenAiConfig, OpenAiProvider};
use crate::mapper::{CodeMapperPipeline, DocMetadata, render_run, write_docs};
use crate::research::{DeepResearchService, StrategyDeps, TracingSink, build_strategy};
use crate::store::SqliteChunkStore;

/// Default index database file name inside the data directory.
const DEFAULT_DB_NAME: &str = "quarry/index.db";

/// Output format for research answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain markdown to stdout.
    Text,
    /// JSON envelope with answer and metadata.
    Json,
}

/// Quarry: deep code research over indexed repositories.
#[derive(Debug, Parser)]
#[command(name = "quarry", version, about)]
pub struct Cli {
    /// Path to the index database (defaults to the platform data dir).
    #[arg(long, global = true, env = "QUARRY_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Base directory indexed paths resolve against.
    #[arg(long, global = true, env = "QUARRY_BASE_DIR", default_value = ".")]
    pub base_dir: PathBuf,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Answer a question about the indexed repository.
    Research {
        /// The research question.
        query: String,

        /// Exploration algorithm (v1=BFS, v2=wide coverage, v3=parallel).
        #[arg(long, value_parser = parse_algorithm)]
        algorithm: Option<Algorithm>,

        /// Restrict the search to paths under this prefix.
        #[arg(long)]
        path: Option<String>,

        /// Lift time and result caps for exhaustive retrieval.
        #[arg(long)]
        exhaustive: bool,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Generate code-mapper documentation for a scope.
    Map {
        /// Scope prefix (e.g. `src/`). Empty maps the whole index.
        #[arg(default_value = "")]
        scope: String,

        /// Planning thoroughness.
        #[arg(long, value_parser = parse_comprehensiveness, default_value = "medium")]
        comprehensiveness: Comprehensiveness,

        /// Maximum architectural points of interest.
        #[arg(long, default_value_t = 10)]
        max_points: usize,

        /// PoI research concurrency (auto when omitted).
        #[arg(long)]
        jobs: Option<usize>,

        /// Output directory for generated documents.
        #[arg(long, default_value = "code_map")]
        out_dir: PathBuf,
    },
}

fn parse_algorithm(value: &str) -> Result<Algorithm, String> {
    Algorithm::parse(value).ok_or_else(|| format!("unknown algorithm '{value}' (use v1/v2/v3)"))
}

fn parse_comprehensiveness(value: &str) -> Result<Comprehensiveness, String> {
    Comprehensiveness::parse(value).ok_or_else(|| {
        format!("unknown comprehensiveness '{value}' (use minimal/low/medium/high/ultra)")
    })
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DB_NAME)
}

/// Runs the CLI.
///
/// # Errors
///
/// Returns [`Error`] on configuration, store, or research failures.
pub async fn run(cli: Cli) -> Result<(), Error> {
    let db_path = cli.db.unwrap_or_else(default_db_path);
    info!("using index database at {}", db_path.display());

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::default());
    let store = Arc::new(SqliteChunkStore::open(
        &db_path,
        cli.base_dir.clone(),
        Arc::clone(&embedder),
    )?);

    let llm: Arc<dyn LlmProvider> = {
        let llm_config = OpenAiConfig::from_env().map_err(Error::Llm)?;
        Arc::new(OpenAiProvider::new(&llm_config))
    };

    match cli.command {
        Commands::Research {
            query,
            algorithm,
            path,
            exhaustive,
            format,
        } => {
            let mut config = ResearchConfig::from_env();
            if let Some(algorithm) = algorithm {
                config.algorithm = algorithm;
            }
            if exhaustive {
                config.exhaustive_mode = true;
            }

            let deps = StrategyDeps {
                store: Arc::clone(&store) as _,
                embedder: Arc::clone(&embedder),
                llm: Arc::clone(&llm),
                config: config.clone(),
            };
            let strategy = build_strategy(&deps)?;
            let service = DeepResearchService::new(
                Arc::clone(&store) as _,
                embedder,
                llm,
                strategy,
                config,
                Some(Arc::new(TracingSink)),
                path,
            );

            let result = service.deep_research(&query).await?;
            match format {
                OutputFormat::Text => println!("{}", result.answer),
                OutputFormat::Json => {
                    let envelope = serde_json::json!({
                        "answer": result.answer,
                        "metadata": {
                            "nodes_explored": result.metadata.nodes_explored,
                            "chunks_analyzed": result.metadata.chunks_analyzed,
                            "files_analyzed": result.metadata.files_analyzed,
                            "clusters": result.metadata.clusters,
                            "facts_extracted": result.metadata.facts_extracted,
                        },
                    });
                    println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
                }
            }
        }

        Commands::Map {
            scope,
            comprehensiveness,
            max_points,
            jobs,
            out_dir,
        } => {
            let research_config = ResearchConfig::from_env();
            let deps = StrategyDeps {
                store: Arc::clone(&store) as _,
                embedder: Arc::clone(&embedder),
                llm: Arc::clone(&llm),
                config: research_config.clone(),
            };
            let strategy = build_strategy(&deps)?;
            let service = Arc::new(DeepResearchService::new(
                Arc::clone(&store) as _,
                Arc::clone(&embedder),
                Arc::clone(&llm),
                strategy,
                research_config,
                Some(Arc::new(TracingSink)),
                Some(scope.clone()).filter(|s| !s.is_empty()),
            ));

            let mapper_config = MapperConfig {
                comprehensiveness,
                max_points,
                poi_jobs: jobs,
            };
            let pipeline = CodeMapperPipeline::new(
                Arc::clone(&store) as _,
                Arc::clone(&llm),
                service,
                mapper_config,
            );

            let run = pipeline.run(&scope).await?;
            let meta = DocMetadata {
                created_from_sha: std::env::var("QUARRY_SOURCE_SHA")
                    .unwrap_or_else(|_| "unknown".to_string()),
                generated_at: chrono::Utc::now().to_rfc3339(),
                llm_config: serde_json::json!({"model": llm.model(), "provider": llm.name()}),
                generation_stats: serde_json::json!({
                    "total_points": run.total_points,
                    "failed": run.sections.iter().filter(|s| s.failed).count(),
                    "serialized": run.serialized,
                    "scope_files": run.scope_files.len(),
                    "unreferenced_files": run.unreferenced_files.len(),
                }),
            };

            let docs = render_run(&run, &scope, &meta);
            let written = write_docs(&docs, &out_dir).await.map_err(Error::Mapper)?;
            println!("wrote {} documents to {}", written.len(), out_dir.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_research_subcommand_args() {
        let cli = Cli::parse_from([
            "quarry",
            "research",
            "how does retry work",
            "--algorithm",
            "v2",
            "--exhaustive",
        ]);
        match cli.command {
            Commands::Research {
                query,
                algorithm,
                exhaustive,
                ..
            } => {
                assert_eq!(query, "how does retry work");
                assert_eq!(algorithm, Some(Algorithm::V2));
                assert!(exhaustive);
            }
            Commands::Map { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_map_subcommand_defaults() {
        let cli = Cli::parse_from(["quarry", "map", "src/"]);
        match cli.command {
            Commands::Map {
                scope,
                comprehensiveness,
                max_points,
                jobs,
                ..
            } => {
                assert_eq!(scope, "src/");
                assert_eq!(comprehensiveness, Comprehensiveness::Medium);
                assert_eq!(max_points, 10);
                assert!(jobs.is_none());
            }
            Commands::Research { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_bad_algorithm_rejected() {
        let result = Cli::try_parse_from(["quarry", "research", "q", "--algorithm", "v9"]);
        assert!(result.is_err());
    }
}
