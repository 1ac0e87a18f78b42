//! Depth-limited CART regression tree (squared error)

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Growth limits for a single tree
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub max_depth: usize,
    /// Nodes with fewer samples become leaves
    pub min_samples_split: usize,
    /// Features considered per split; `None` means all
    pub max_features: Option<usize>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_samples_split: 2,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Flattened tree; node 0 is the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    score: f64,
}

impl RegressionTree {
    /// Grow a tree over the rows selected by `indices` (duplicates allowed)
    pub fn fit(
        x: &[Vec<f64>],
        y: &[f64],
        indices: Vec<usize>,
        options: &TreeOptions,
        rng: &mut StdRng,
    ) -> Self {
        let width = x.first().map(|r| r.len()).unwrap_or(0);
        let mut builder = Builder {
            x,
            y,
            width,
            options,
            nodes: Vec::new(),
        };
        builder.grow(indices, 0, rng);
        Self {
            nodes: builder.nodes,
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

struct Builder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    width: usize,
    options: &'a TreeOptions,
    nodes: Vec<Node>,
}

impl Builder<'_> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let value = if indices.is_empty() {
            0.0
        } else {
            indices.iter().map(|&i| self.y[i]).sum::<f64>() / indices.len() as f64
        };
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        if depth >= self.options.max_depth
            || indices.len() < self.options.min_samples_split.max(2)
        {
            return id;
        }

        let Some(split) = self.best_split(&indices, rng) else {
            return id;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| self.x[i][split.feature] <= split.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return id;
        }

        let left = self.grow(left_rows, depth + 1, rng);
        let right = self.grow(right_rows, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn candidate_features(&self, rng: &mut StdRng) -> Vec<usize> {
        let mut features: Vec<usize> = (0..self.width).collect();
        if let Some(k) = self.options.max_features {
            if k < self.width {
                features.shuffle(rng);
                features.truncate(k.max(1));
            }
        }
        features
    }

    /// Split maximizing `S_l²/n_l + S_r²/n_r`, i.e. minimizing child SSE
    fn best_split(&self, indices: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let n = indices.len() as f64;
        let total: f64 = indices.iter().map(|&i| self.y[i]).sum();
        let parent_score = total * total / n;
        let mut best: Option<SplitCandidate> = None;

        for feature in self.candidate_features(rng) {
            let mut pairs: Vec<(f64, f64)> = indices
                .iter()
                .map(|&i| (self.x[i][feature], self.y[i]))
                .collect();
            pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

            let mut left_sum = 0.0;
            for k in 0..pairs.len() - 1 {
                left_sum += pairs[k].1;
                if pairs[k].0 == pairs[k + 1].0 {
                    continue;
                }
                let left_n = (k + 1) as f64;
                let right_n = n - left_n;
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / left_n + right_sum * right_sum / right_n;
                if score > parent_score + 1e-12
                    && best.as_ref().map(|b| score > b.score).unwrap_or(true)
                {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (pairs[k].0 + pairs[k + 1].0) / 2.0,
                        score,
                    });
                }
            }
        }
        best
    }
}
