//! Pareto dominance over objective vectors.

use crate::optimization::Objective;

/// Returns `true` if `a` Pareto-dominates `b`: at least as good in every
/// objective and strictly better in one.
pub fn dominates(a: &[f64], b: &[f64], objectives: &[Objective]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), objectives.len());

    let mut strictly_better = false;
    for ((&av, &bv), objective) in a.iter().zip(b.iter()).zip(objectives.iter()) {
        if objective.is_better(bv, av) {
            return false;
        }
        if objective.is_better(av, bv) {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Indices of the non-dominated points, in input order.
pub fn pareto_front(points: &[Vec<f64>], objectives: &[Objective]) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| {
            !points
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && dominates(other, &points[i], objectives))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objectives() -> Vec<Objective> {
        vec![Objective::minimize("latency"), Objective::maximize("accuracy")]
    }

    #[test]
    fn dominance_respects_direction() {
        let obj = objectives();
        assert!(dominates(&[10.0, 0.9], &[20.0, 0.8], &obj));
        assert!(!dominates(&[10.0, 0.7], &[20.0, 0.8], &obj));
        assert!(!dominates(&[10.0, 0.9], &[10.0, 0.9], &obj));
    }

    #[test]
    fn front_keeps_trade_offs() {
        let points = vec![
            vec![10.0, 0.7],
            vec![20.0, 0.9],
            vec![25.0, 0.85], // dominated by [20, 0.9]
            vec![5.0, 0.6],
        ];
        assert_eq!(pareto_front(&points, &objectives()), vec![0, 1, 3]);
    }

    #[test]
    fn duplicates_both_stay_on_front() {
        let points = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        assert_eq!(pareto_front(&points, &objectives()), vec![0, 1]);
    }
}
