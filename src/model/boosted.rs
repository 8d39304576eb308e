//! Gradient-boosted tree meta-classifier read from an XGBoost JSON model.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::{
    error::ServiceError,
    model::{FeatureClassifier, scores::softmax},
};

#[derive(Deserialize)]
struct XgbDocument {
    learner: XgbLearner,
}

#[derive(Deserialize)]
struct XgbLearner {
    gradient_booster: XgbBooster,
    learner_model_param: XgbModelParam,
    objective: XgbObjective,
}

#[derive(Deserialize)]
struct XgbBooster {
    name: String,
    model: Option<XgbGbtreeModel>,
}

#[derive(Deserialize)]
struct XgbGbtreeModel {
    trees: Vec<XgbTree>,
    tree_info: Vec<usize>,
}

#[derive(Deserialize)]
struct XgbModelParam {
    base_score: String,
    num_class: String,
    num_feature: String,
}

#[derive(Deserialize)]
struct XgbObjective {
    name: String,
}

#[derive(Deserialize)]
struct XgbTree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<u32>,
    split_conditions: Vec<f32>,
    default_left: Vec<XgbFlag>,
    #[serde(default)]
    split_type: Vec<u8>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum XgbFlag {
    Bool(bool),
    Int(u8),
}

impl XgbFlag {
    fn is_set(&self) -> bool {
        match self {
            XgbFlag::Bool(b) => *b,
            XgbFlag::Int(i) => *i != 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    /// `None` for leaves.
    children: Option<(usize, usize)>,
    feature: usize,
    /// Split threshold for inner nodes, leaf value for leaves.
    value: f32,
    default_left: bool,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn from_xgb(raw: XgbTree, num_features: usize, tree_id: usize) -> Result<Self, ServiceError> {
        let len = raw.left_children.len();
        if [
            raw.right_children.len(),
            raw.split_indices.len(),
            raw.split_conditions.len(),
            raw.default_left.len(),
        ]
        .iter()
        .any(|&n| n != len)
            || len == 0
        {
            return Err(invalid(format!("tree {tree_id} has inconsistent node arrays")));
        }
        if raw.split_type.iter().any(|&t| t != 0) {
            return Err(invalid(format!(
                "tree {tree_id} uses categorical splits, which are not supported"
            )));
        }

        let mut nodes = Vec::with_capacity(len);
        for idx in 0..len {
            let (left, right) = (raw.left_children[idx], raw.right_children[idx]);
            let children = if left < 0 {
                None
            } else {
                let (left, right) = (left as usize, right as usize);
                // children always follow their parent, so traversal terminates
                if left <= idx || right <= idx || left >= len || right >= len {
                    return Err(invalid(format!(
                        "tree {tree_id} node {idx} has out-of-order children"
                    )));
                }
                let feature = raw.split_indices[idx] as usize;
                if feature >= num_features {
                    return Err(invalid(format!(
                        "tree {tree_id} splits on feature {feature} of {num_features}"
                    )));
                }
                Some((left, right))
            };
            nodes.push(Node {
                children,
                feature: raw.split_indices[idx] as usize,
                value: raw.split_conditions[idx],
                default_left: raw.default_left[idx].is_set(),
            });
        }
        Ok(Self { nodes })
    }

    fn leaf_value(&self, features: &[f32]) -> f32 {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            let Some((left, right)) = node.children else {
                return node.value;
            };
            let x = features[node.feature];
            idx = if x.is_nan() {
                if node.default_left { left } else { right }
            } else if x < node.value {
                left
            } else {
                right
            };
        }
    }
}

fn invalid(msg: String) -> ServiceError {
    ServiceError::InvalidManifest(format!("meta model: {msg}"))
}

fn parse_count(raw: &str, field: &str) -> Result<usize, ServiceError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(format!("{field} is not an integer: '{raw}'")))
}

/// `"5E-1"` or, for vector-leaf models, `"[5E-1,5E-1]"`.
fn parse_base_score(raw: &str, num_classes: usize) -> Result<Vec<f32>, ServiceError> {
    let values: Vec<f32> = raw
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid(format!("base_score is not numeric: '{raw}'")))?;
    match values.len() {
        1 => Ok(vec![values[0]; num_classes]),
        n if n == num_classes => Ok(values),
        n => Err(invalid(format!(
            "base_score has {n} entries for {num_classes} classes"
        ))),
    }
}

/// Multi-class boosted trees: each tree adds its leaf value to the margin of
/// the class it was grown for, margins go through softmax.
#[derive(Debug, Clone)]
pub struct BoostedTreeEnsemble {
    name: String,
    num_features: usize,
    num_classes: usize,
    base_margin: Vec<f32>,
    trees: Vec<Tree>,
    tree_class: Vec<usize>,
}

impl BoostedTreeEnsemble {
    pub fn from_path(name: &str, path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(name, &raw)
    }

    pub fn from_json(name: &str, raw: &str) -> Result<Self, ServiceError> {
        let doc: XgbDocument =
            serde_json::from_str(raw).map_err(|e| invalid(format!("unreadable JSON: {e}")))?;
        let learner = doc.learner;

        match learner.objective.name.as_str() {
            "multi:softprob" | "multi:softmax" => {}
            other => return Err(invalid(format!("unsupported objective '{other}'"))),
        }
        if learner.gradient_booster.name != "gbtree" {
            return Err(invalid(format!(
                "unsupported booster '{}'",
                learner.gradient_booster.name
            )));
        }
        let model = learner
            .gradient_booster
            .model
            .ok_or_else(|| invalid("booster has no tree model".into()))?;

        let num_classes = parse_count(&learner.learner_model_param.num_class, "num_class")?;
        let num_features = parse_count(&learner.learner_model_param.num_feature, "num_feature")?;
        if num_classes < 2 {
            return Err(invalid(format!("num_class is {num_classes}")));
        }
        let base_margin = parse_base_score(&learner.learner_model_param.base_score, num_classes)?;

        if model.trees.len() != model.tree_info.len() {
            return Err(invalid(format!(
                "{} trees but {} tree_info entries",
                model.trees.len(),
                model.tree_info.len()
            )));
        }
        if let Some(&class) = model.tree_info.iter().find(|&&c| c >= num_classes) {
            return Err(invalid(format!("tree assigned to class {class} of {num_classes}")));
        }
        let trees = model
            .trees
            .into_iter()
            .enumerate()
            .map(|(id, tree)| Tree::from_xgb(tree, num_features, id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            num_features,
            num_classes,
            base_margin,
            trees,
            tree_class: model.tree_info,
        })
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn margins(&self, features: &[f32]) -> Result<Vec<f32>, ServiceError> {
        if features.len() != self.num_features {
            return Err(ServiceError::ShapeMismatch {
                model: self.name.clone(),
                what: "features",
                expected: self.num_features,
                actual: features.len(),
            });
        }
        let mut margins = self.base_margin.clone();
        for (tree, &class) in self.trees.iter().zip(&self.tree_class) {
            margins[class] += tree.leaf_value(features);
        }
        Ok(margins)
    }
}

impl FeatureClassifier for BoostedTreeEnsemble {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ServiceError> {
        Ok(softmax(&self.margins(features)?))
    }
}
