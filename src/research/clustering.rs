//! File clustering for map-reduce synthesis.
//!
//! Two modes over file embeddings: fixed-k k-means for budget-driven
//! clustering, and HDBSCAN for natural semantic grouping with token bounds
//! enforced afterwards (split oversized clusters recursively, merge
//! undersized ones into their nearest neighbor).

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::models::KMEANS_N_INIT;
use crate::embedding::{EmbeddingProvider, euclidean_distance};
use crate::error::ResearchError;
use crate::llm::LlmProvider;

/// Deterministic seed for k-means initialization.
const KMEANS_SEED: u64 = 42;
/// Lloyd's iteration cap.
const KMEANS_MAX_ITERS: usize = 100;

/// A cluster of files for synthesis.
#[derive(Debug, Clone)]
pub struct ClusterGroup {
    /// Sequential cluster id.
    pub cluster_id: usize,
    /// File paths in this cluster.
    pub file_paths: Vec<String>,
    /// `file_path -> content` for this cluster.
    pub files_content: BTreeMap<String, String>,
    /// Token total across the cluster's files.
    pub total_tokens: usize,
}

/// Summary metadata for one clustering pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterSummary {
    /// Final cluster count.
    pub num_clusters: usize,
    /// HDBSCAN clusters before outlier reassignment and bounds.
    pub num_native_clusters: usize,
    /// Noise points reassigned to the nearest centroid.
    pub num_outliers: usize,
    /// Split operations performed.
    pub num_splits: usize,
    /// Merge operations performed.
    pub num_merges: usize,
    /// Clusters left undersized because no merge target fit.
    pub num_unmergeable: usize,
    /// Total files clustered.
    pub total_files: usize,
    /// Total tokens across all files.
    pub total_tokens: usize,
    /// Average tokens per final cluster.
    pub avg_tokens_per_cluster: usize,
}

/// Cluster ids flagged during bounds enforcement.
#[derive(Debug, Clone, Default)]
pub struct ClusterFlags {
    /// Clusters that stayed under the minimum because merging would exceed
    /// the maximum.
    pub unmergeable: Vec<usize>,
    /// Clusters holding a single file that alone exceeds the maximum.
    pub oversize_single_file: Vec<usize>,
}

/// Service for clustering files by embedding similarity.
pub struct ClusteringService {
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
}

impl ClusteringService {
    /// Creates a clustering service.
    #[must_use]
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { embedder, llm }
    }

    fn file_tokens(&self, files: &BTreeMap<String, String>) -> BTreeMap<String, usize> {
        files
            .iter()
            .map(|(path, content)| (path.clone(), self.llm.estimate_tokens(content)))
            .collect()
    }

    fn single_cluster(
        files: &BTreeMap<String, String>,
        total_tokens: usize,
    ) -> (Vec<ClusterGroup>, ClusterSummary) {
        let group = ClusterGroup {
            cluster_id: 0,
            file_paths: files.keys().cloned().collect(),
            files_content: files.clone(),
            total_tokens,
        };
        let summary = ClusterSummary {
            num_clusters: 1,
            num_native_clusters: 1,
            total_files: files.len(),
            total_tokens,
            avg_tokens_per_cluster: total_tokens,
            ..ClusterSummary::default()
        };
        (vec![group], summary)
    }

    async fn embed_files(
        &self,
        files: &BTreeMap<String, String>,
    ) -> Result<(Vec<String>, Vec<Vec<f32>>), ResearchError> {
        let file_paths: Vec<String> = files.keys().cloned().collect();
        let contents: Vec<String> = file_paths
            .iter()
            .filter_map(|p| files.get(p).cloned())
            .collect();
        debug!("generating embeddings for {} files", contents.len());
        let embeddings = self
            .embedder
            .embed_batch(&contents)
            .await
            .map_err(|e| ResearchError::Clustering(format!("embedding failed: {e}")))?;
        Ok((file_paths, embeddings))
    }

    fn build_groups(
        files: &BTreeMap<String, String>,
        file_tokens: &BTreeMap<String, usize>,
        assignments: &BTreeMap<usize, Vec<String>>,
    ) -> Vec<ClusterGroup> {
        assignments
            .iter()
            .enumerate()
            .map(|(new_id, (_, paths))| {
                let files_content: BTreeMap<String, String> = paths
                    .iter()
                    .filter_map(|p| files.get(p).map(|c| (p.clone(), c.clone())))
                    .collect();
                let total_tokens = paths
                    .iter()
                    .map(|p| file_tokens.get(p).copied().unwrap_or(0))
                    .sum();
                ClusterGroup {
                    cluster_id: new_id,
                    file_paths: paths.clone(),
                    files_content,
                    total_tokens,
                }
            })
            .collect()
    }

    /// Clusters files into exactly `n_clusters` via k-means (clamped to the
    /// file count; degenerate cases return a single cluster).
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Clustering`] for empty input, `n_clusters`
    /// of 0, or embedding failures.
    pub async fn cluster_files(
        &self,
        files: &BTreeMap<String, String>,
        n_clusters: usize,
    ) -> Result<(Vec<ClusterGroup>, ClusterSummary), ResearchError> {
        if files.is_empty() {
            return Err(ResearchError::Clustering(
                "cannot cluster empty files map".to_string(),
            ));
        }
        if n_clusters == 0 {
            return Err(ResearchError::Clustering(
                "n_clusters must be at least 1".to_string(),
            ));
        }

        let n_clusters = n_clusters.min(files.len());
        let file_tokens = self.file_tokens(files);
        let total_tokens: usize = file_tokens.values().sum();

        info!(
            "k-means clustering {} files ({total_tokens} tokens) into {n_clusters} clusters",
            files.len()
        );

        if n_clusters == 1 || files.len() == 1 {
            return Ok(Self::single_cluster(files, total_tokens));
        }

        let (file_paths, embeddings) = self.embed_files(files).await?;
        let labels = kmeans(&embeddings, n_clusters, KMEANS_SEED, KMEANS_N_INIT);

        let mut assignments: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (path, label) in file_paths.iter().zip(&labels) {
            assignments.entry(*label).or_default().push(path.clone());
        }

        let groups = Self::build_groups(files, &file_tokens, &assignments);
        let summary = ClusterSummary {
            num_clusters: groups.len(),
            num_native_clusters: groups.len(),
            total_files: files.len(),
            total_tokens,
            avg_tokens_per_cluster: total_tokens / groups.len().max(1),
            ..ClusterSummary::default()
        };

        info!(
            "k-means complete: {} clusters, avg {} tokens/cluster",
            summary.num_clusters, summary.avg_tokens_per_cluster
        );

        Ok((groups, summary))
    }

    /// HDBSCAN clustering with token bounds enforcement.
    ///
    /// Runs HDBSCAN (noise reassigned to the nearest centroid), then splits
    /// clusters exceeding `max_tokens_per_cluster` recursively with
    /// k-means(k=2), falling back to deterministic greedy bin-packing when
    /// the embeddings cannot be split, and merges clusters below
    /// `min_tokens_per_cluster` into the nearest centroid that keeps the
    /// merged total within the maximum. Clusters with no valid merge target
    /// are flagged unmergeable; a single file above the maximum is kept
    /// as-is with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Clustering`] for empty input or embedding
    /// failures.
    #[allow(clippy::too_many_lines)]
    pub async fn cluster_files_hdbscan_bounded(
        &self,
        files: &BTreeMap<String, String>,
        min_cluster_size: usize,
        min_tokens_per_cluster: usize,
        max_tokens_per_cluster: usize,
    ) -> Result<(Vec<ClusterGroup>, ClusterSummary, ClusterFlags), ResearchError> {
        if files.is_empty() {
            return Err(ResearchError::Clustering(
                "cannot cluster empty files map".to_string(),
            ));
        }

        let file_tokens = self.file_tokens(files);
        let total_tokens: usize = file_tokens.values().sum();

        info!(
            "hdbscan bounded clustering {} files ({total_tokens} tokens), \
             bounds: [{min_tokens_per_cluster}, {max_tokens_per_cluster}]",
            files.len()
        );

        if files.len() == 1 {
            let (groups, summary) = Self::single_cluster(files, total_tokens);
            let mut flags = ClusterFlags::default();
            if total_tokens > max_tokens_per_cluster {
                warn!(
                    "single file exceeds max_tokens_per_cluster \
                     ({total_tokens} > {max_tokens_per_cluster})"
                );
                flags.oversize_single_file.push(0);
            }
            return Ok((groups, summary, flags));
        }

        let (file_paths, embeddings) = self.embed_files(files).await?;
        let file_embeddings: BTreeMap<&str, &Vec<f32>> = file_paths
            .iter()
            .map(String::as_str)
            .zip(embeddings.iter())
            .collect();

        // HDBSCAN with a clamped minimum cluster size
        let effective_min = min_cluster_size.min(embeddings.len() - 1).max(2);
        debug!("running hdbscan with min_cluster_size={effective_min}");

        let params = hdbscan::HdbscanHyperParams::builder()
            .min_cluster_size(effective_min)
            .min_samples(1)
            .build();
        let clusterer = hdbscan::Hdbscan::new(&embeddings, params);
        let mut labels: Vec<i32> = match clusterer.cluster() {
            Ok(labels) => labels,
            Err(e) => {
                warn!("hdbscan clustering failed: {e:?}, using single cluster");
                vec![0; embeddings.len()]
            }
        };

        let num_native_clusters = {
            let mut unique: Vec<i32> = labels.iter().copied().filter(|&l| l >= 0).collect();
            unique.sort_unstable();
            unique.dedup();
            unique.len()
        };
        let num_outliers = labels.iter().filter(|&&l| l == -1).count();

        reassign_outliers_to_nearest(&mut labels, &embeddings);

        // Initial assignment map
        let mut assignments: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (path, label) in file_paths.iter().zip(&labels) {
            #[allow(clippy::cast_sign_loss)]
            assignments
                .entry(*label as usize)
                .or_default()
                .push(path.clone());
        }

        let cluster_tokens = |paths: &[String]| -> usize {
            paths
                .iter()
                .map(|p| file_tokens.get(p).copied().unwrap_or(0))
                .sum()
        };

        // Phase 1: split oversized clusters recursively
        let mut num_splits = 0;
        let mut split_assignments: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut next_id = 0;
        for paths in assignments.into_values() {
            let tokens = cluster_tokens(&paths);
            if tokens > max_tokens_per_cluster && paths.len() > 1 {
                debug!(
                    "splitting cluster ({tokens} tokens, {} files) recursively",
                    paths.len()
                );
                let subclusters = split_recursively(
                    paths,
                    &file_tokens,
                    &file_embeddings,
                    max_tokens_per_cluster,
                );
                for subcluster in subclusters {
                    split_assignments.insert(next_id, subcluster);
                    next_id += 1;
                }
                num_splits += 1;
            } else {
                split_assignments.insert(next_id, paths);
                next_id += 1;
            }
        }
        let mut assignments = split_assignments;

        // Phase 2: merge undersized clusters
        let mut num_merges = 0;
        let mut unmergeable: Vec<usize> = Vec::new();
        while assignments.len() > 1 {
            let Some((&smallest_id, smallest_tokens)) = assignments
                .iter()
                .filter(|(id, _)| !unmergeable.contains(id))
                .map(|(id, paths)| (id, cluster_tokens(paths)))
                .min_by_key(|(_, tokens)| *tokens)
            else {
                break; // all remaining clusters are unmergeable
            };

            if smallest_tokens >= min_tokens_per_cluster {
                break;
            }

            let centroid_of = |paths: &[String]| -> Vec<f32> {
                centroid(
                    paths
                        .iter()
                        .filter_map(|p| file_embeddings.get(p.as_str()).copied()),
                )
            };

            let smallest_centroid = centroid_of(&assignments[&smallest_id]);
            let target = assignments
                .iter()
                .filter(|&(&id, paths)| {
                    id != smallest_id
                        && smallest_tokens + cluster_tokens(paths) <= max_tokens_per_cluster
                })
                .map(|(&id, paths)| {
                    (
                        id,
                        euclidean_distance(&smallest_centroid, &centroid_of(paths)),
                    )
                })
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(id, _)| id);

            match target {
                Some(target_id) => {
                    debug!("merging cluster {smallest_id} ({smallest_tokens} tokens) into {target_id}");
                    let absorbed = assignments.remove(&smallest_id).unwrap_or_default();
                    if let Some(target_paths) = assignments.get_mut(&target_id) {
                        target_paths.extend(absorbed);
                    }
                    num_merges += 1;
                }
                None => {
                    warn!(
                        "cluster {smallest_id} ({smallest_tokens} tokens) cannot merge \
                         without exceeding max ({max_tokens_per_cluster}), keeping"
                    );
                    unmergeable.push(smallest_id);
                }
            }
        }

        // Phase 3: renumber sequentially and surface flags against final ids
        let mut flags = ClusterFlags::default();
        let renumbered: BTreeMap<usize, Vec<String>> = assignments
            .iter()
            .enumerate()
            .map(|(new_id, (old_id, paths))| {
                if unmergeable.contains(old_id) {
                    flags.unmergeable.push(new_id);
                }
                if paths.len() == 1 && cluster_tokens(paths) > max_tokens_per_cluster {
                    flags.oversize_single_file.push(new_id);
                }
                (new_id, paths.clone())
            })
            .collect();

        let groups = Self::build_groups(files, &file_tokens, &renumbered);
        let summary = ClusterSummary {
            num_clusters: groups.len(),
            num_native_clusters,
            num_outliers,
            num_splits,
            num_merges,
            num_unmergeable: flags.unmergeable.len(),
            total_files: files.len(),
            total_tokens,
            avg_tokens_per_cluster: total_tokens / groups.len().max(1),
        };

        info!(
            "hdbscan bounded complete: {num_native_clusters} native, {num_outliers} outliers \
             reassigned, {num_splits} splits, {num_merges} merges, {} unmergeable, \
             {} final clusters",
            summary.num_unmergeable, summary.num_clusters
        );

        Ok((groups, summary, flags))
    }
}

/// Mean of an embedding iterator.
fn centroid<'a>(embeddings: impl Iterator<Item = &'a Vec<f32>>) -> Vec<f32> {
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for embedding in embeddings {
        if sum.is_empty() {
            sum = vec![0.0; embedding.len()];
        }
        for (s, v) in sum.iter_mut().zip(embedding) {
            *s += v;
        }
        count += 1;
    }
    if count > 0 {
        #[allow(clippy::cast_precision_loss)]
        for s in &mut sum {
            *s /= count as f32;
        }
    }
    sum
}

/// Reassigns noise points (label -1) to the nearest valid centroid. When
/// every point is noise, collapses to a single cluster.
fn reassign_outliers_to_nearest(labels: &mut [i32], embeddings: &[Vec<f32>]) {
    if !labels.contains(&-1) {
        return;
    }

    let mut valid_labels: Vec<i32> = labels.iter().copied().filter(|&l| l >= 0).collect();
    valid_labels.sort_unstable();
    valid_labels.dedup();

    if valid_labels.is_empty() {
        debug!("all points are outliers, creating single cluster");
        labels.fill(0);
        return;
    }

    let centroids: Vec<(i32, Vec<f32>)> = valid_labels
        .iter()
        .map(|&label| {
            let members = labels
                .iter()
                .zip(embeddings)
                .filter(|&(&l, _)| l == label)
                .map(|(_, e)| e);
            (label, centroid(members))
        })
        .collect();

    let mut reassigned = 0;
    for (label, embedding) in labels.iter_mut().zip(embeddings) {
        if *label == -1 {
            let nearest = centroids
                .iter()
                .min_by(|(_, a), (_, b)| {
                    euclidean_distance(embedding, a)
                        .partial_cmp(&euclidean_distance(embedding, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map_or(0, |(l, _)| *l);
            *label = nearest;
            reassigned += 1;
        }
    }
    debug!("reassigned {reassigned} outliers to nearest clusters");
}

/// Splits a file list into clusters respecting `max_tokens` recursively via
/// k-means(k=2), with a greedy token bin-packing fallback when k-means
/// cannot separate identical embeddings.
fn split_recursively(
    paths: Vec<String>,
    file_tokens: &BTreeMap<String, usize>,
    file_embeddings: &BTreeMap<&str, &Vec<f32>>,
    max_tokens: usize,
) -> Vec<Vec<String>> {
    let tokens: usize = paths
        .iter()
        .map(|p| file_tokens.get(p).copied().unwrap_or(0))
        .sum();

    if tokens > max_tokens && paths.len() == 1 {
        warn!(
            "single file exceeds max_tokens_per_cluster ({tokens} > {max_tokens}): {}",
            paths[0]
        );
    }
    if tokens <= max_tokens || paths.len() <= 1 {
        return vec![paths];
    }

    let embeddings: Vec<Vec<f32>> = paths
        .iter()
        .filter_map(|p| file_embeddings.get(p.as_str()).map(|e| (*e).clone()))
        .collect();
    let labels = kmeans(&embeddings, 2, KMEANS_SEED, KMEANS_N_INIT);

    let mut cluster_0: Vec<String> = Vec::new();
    let mut cluster_1: Vec<String> = Vec::new();
    for (path, label) in paths.iter().zip(&labels) {
        if *label == 0 {
            cluster_0.push(path.clone());
        } else {
            cluster_1.push(path.clone());
        }
    }

    if cluster_0.is_empty() || cluster_1.is_empty() {
        warn!(
            "k-means could not split {} files (identical embeddings?), \
             using token-balanced fallback",
            paths.len()
        );
        let mut sorted = paths;
        sorted.sort_by_key(|p| std::cmp::Reverse(file_tokens.get(p).copied().unwrap_or(0)));
        cluster_0 = Vec::new();
        cluster_1 = Vec::new();
        let (mut tokens_0, mut tokens_1) = (0usize, 0usize);
        for path in sorted {
            let t = file_tokens.get(&path).copied().unwrap_or(0);
            if tokens_0 <= tokens_1 {
                cluster_0.push(path);
                tokens_0 += t;
            } else {
                cluster_1.push(path);
                tokens_1 += t;
            }
        }
    }

    let mut result = Vec::new();
    for subcluster in [cluster_0, cluster_1] {
        result.extend(split_recursively(
            subcluster,
            file_tokens,
            file_embeddings,
            max_tokens,
        ));
    }
    result
}

/// Lloyd's k-means with seeded initialization and multiple restarts.
///
/// Deterministic for a given input: each restart uses `seed + init` and the
/// lowest-inertia labeling wins.
#[must_use]
pub(crate) fn kmeans(embeddings: &[Vec<f32>], k: usize, seed: u64, n_init: usize) -> Vec<usize> {
    let n = embeddings.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(n);
    if k == 1 {
        return vec![0; n];
    }

    let mut best_labels = vec![0usize; n];
    let mut best_inertia = f32::INFINITY;

    for init in 0..n_init.max(1) {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(init as u64));
        let mut centroids: Vec<Vec<f32>> = sample(&mut rng, n, k)
            .into_iter()
            .map(|i| embeddings[i].clone())
            .collect();

        let mut labels = vec![0usize; n];
        for _ in 0..KMEANS_MAX_ITERS {
            let new_labels: Vec<usize> = embeddings
                .par_iter()
                .map(|point| {
                    centroids
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| {
                            euclidean_distance(point, a)
                                .partial_cmp(&euclidean_distance(point, b))
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map_or(0, |(i, _)| i)
                })
                .collect();

            let converged = new_labels == labels;
            labels = new_labels;

            for (cluster, c) in centroids.iter_mut().enumerate() {
                let members = labels
                    .iter()
                    .zip(embeddings)
                    .filter(|&(&l, _)| l == cluster)
                    .map(|(_, e)| e);
                let mean = centroid(members);
                if !mean.is_empty() {
                    *c = mean;
                }
            }

            if converged {
                break;
            }
        }

        let inertia: f32 = embeddings
            .iter()
            .zip(&labels)
            .map(|(point, &label)| {
                let d = euclidean_distance(point, &centroids[label]);
                d * d
            })
            .sum();

        if inertia < best_inertia {
            best_inertia = inertia;
            best_labels = labels;
        }
    }

    best_labels
}
