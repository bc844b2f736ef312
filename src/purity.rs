//! Purity of a clustering against ground-truth classes.
//!
//! ```text
//! purity = Σ_clusters max_class |cluster ∩ class| / N
//! ```
//!
//! Only patients present in both the assignment list and the label map take
//! part (inner join on patient ID); everyone else is counted and reported but
//! never scored.

use crate::assign::ClusterAssignment;
use crate::error::{EvalError, Result};
use crate::features::PatientId;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

/// `(cluster, class)` pairs for the patients present on both sides of the join.
#[derive(Clone, Debug)]
pub struct JoinedAssignments<C> {
    pub pairs: Vec<(usize, C)>,
    /// Assigned patients with no ground-truth label.
    pub missing_label: usize,
    /// Labelled patients with no cluster assignment.
    pub missing_assignment: usize,
}

pub fn join_labels<C: Copy>(
    assignments: &[ClusterAssignment],
    labels: &HashMap<PatientId, C>,
) -> JoinedAssignments<C> {
    let mut pairs = Vec::with_capacity(assignments.len().min(labels.len()));
    let mut missing_label = 0;
    let mut assigned: HashSet<&PatientId> = HashSet::with_capacity(assignments.len());
    for assignment in assignments {
        assigned.insert(&assignment.patient_id);
        match labels.get(&assignment.patient_id) {
            Some(&class) => pairs.push((assignment.cluster, class)),
            None => missing_label += 1,
        }
    }
    let missing_assignment = labels.keys().filter(|id| !assigned.contains(id)).count();

    if missing_label > 0 || missing_assignment > 0 {
        warn!(
            "Label join: {} matched, {} assigned patients without a label, {} labelled patients without an assignment (excluded from purity).",
            pairs.len(),
            missing_label,
            missing_assignment
        );
    } else {
        debug!("Label join: all {} patients matched.", pairs.len());
    }

    JoinedAssignments {
        pairs,
        missing_label,
        missing_assignment,
    }
}

/// Class make-up of one cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterComposition<C> {
    pub cluster: usize,
    pub size: usize,
    pub class_counts: BTreeMap<C, usize>,
    /// Most frequent class; the smallest class wins a tie.
    pub majority: C,
    pub majority_count: usize,
}

/// Per-cluster contingency, ordered by cluster ID.
pub fn composition<C: Ord + Copy>(pairs: &[(usize, C)]) -> Vec<ClusterComposition<C>> {
    let mut table: BTreeMap<usize, BTreeMap<C, usize>> = BTreeMap::new();
    for &(cluster, class) in pairs {
        *table.entry(cluster).or_default().entry(class).or_insert(0) += 1;
    }

    table
        .into_iter()
        .filter_map(|(cluster, class_counts)| {
            // BTreeMap iterates classes in ascending order and only a strictly
            // larger count replaces the leader, so ties keep the smallest class.
            let mut leader: Option<(C, usize)> = None;
            for (&class, &count) in &class_counts {
                match leader {
                    Some((_, best)) if count <= best => {}
                    _ => leader = Some((class, count)),
                }
            }
            let (majority, majority_count) = leader?;
            Some(ClusterComposition {
                cluster,
                size: class_counts.values().sum(),
                class_counts,
                majority,
                majority_count,
            })
        })
        .collect()
}

/// Fails with [`EvalError::EmptyEvaluation`] on an empty slice instead of
/// returning 0 or NaN.
pub fn purity<C: Ord + Copy>(pairs: &[(usize, C)]) -> Result<f64> {
    if pairs.is_empty() {
        return Err(EvalError::EmptyEvaluation);
    }
    let correct: usize = composition(pairs).iter().map(|c| c.majority_count).sum();
    Ok(correct as f64 / pairs.len() as f64)
}
