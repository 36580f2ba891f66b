//! Priority-class assignment adjustment, shared by both balancers.

use satswarm_types::JobId;
use std::collections::BTreeMap;

/// Fleet-wide per-priority-class aggregates: the distinct priorities in
/// descending order and, per class, the cumulative still-demanded resources
/// of that class and every higher one.
#[derive(Debug, Clone, Default)]
pub struct PriorityHistogram {
    pub priorities: Vec<f32>,
    pub cumulative_demanded: Vec<f64>,
}

impl PriorityHistogram {
    /// Build from per-class (priority, demanded) pairs, any order.
    pub fn from_classes(mut classes: Vec<(f32, f64)>) -> Self {
        classes.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        let mut priorities = Vec::with_capacity(classes.len());
        let mut cumulative_demanded = Vec::with_capacity(classes.len());
        let mut acc = 0.0;
        for (priority, demanded) in classes {
            acc += demanded;
            priorities.push(priority);
            cumulative_demanded.push(acc);
        }
        Self {
            priorities,
            cumulative_demanded,
        }
    }

    pub fn class_of(&self, priority: f32) -> Option<usize> {
        self.priorities.iter().position(|&p| p == priority)
    }
}

/// Re-assign resources per priority class, in descending priority order:
///
/// - C1: the remaining resources cover this class fully → full demand.
/// - C2: this class would exceed the remaining resources → no addition.
/// - C3: the class is partially satisfied → each job gains a share
///   proportional to what of the class fits.
pub fn adjust_assignments(
    assignments: &mut BTreeMap<JobId, f64>,
    demands: &BTreeMap<JobId, u32>,
    priorities: &BTreeMap<JobId, f32>,
    histogram: &PriorityHistogram,
    remaining_resources: f64,
) {
    for (job_id, assignment) in assignments.iter_mut() {
        let demand = demands[job_id] as f64;
        if demands[job_id] == 1 {
            continue;
        }
        let priority = priorities[job_id];
        let Some(class) = histogram.class_of(priority) else {
            tracing::error!(job = %job_id, priority, "priority missing from histogram");
            continue;
        };

        if *assignment == demand || histogram.cumulative_demanded[class] <= remaining_resources {
            // Case 1: assign full demand
            *assignment = demand;
        } else if class == 0 || histogram.cumulative_demanded[class - 1] >= remaining_resources {
            // Case 2: no additional assignment
        } else {
            // Case 3: evenly distribute the class's partially covered share
            let higher = histogram.cumulative_demanded[class - 1];
            let ratio =
                (remaining_resources - higher) / (histogram.cumulative_demanded[class] - higher);
            debug_assert!(ratio > 0.0 && ratio <= 1.0);
            *assignment += ratio * (demand - *assignment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(
        jobs: &[(u64, u32, f32, f64)],
    ) -> (
        BTreeMap<JobId, f64>,
        BTreeMap<JobId, u32>,
        BTreeMap<JobId, f32>,
        PriorityHistogram,
    ) {
        let mut assignments = BTreeMap::new();
        let mut demands = BTreeMap::new();
        let mut priorities = BTreeMap::new();
        let mut classes: BTreeMap<u32, (f32, f64)> = BTreeMap::new();
        for &(id, demand, priority, assignment) in jobs {
            assignments.insert(JobId(id), assignment);
            demands.insert(JobId(id), demand);
            priorities.insert(JobId(id), priority);
            let entry = classes
                .entry((priority * 1000.0) as u32)
                .or_insert((priority, 0.0));
            entry.1 += demand as f64 - assignment;
        }
        let histogram = PriorityHistogram::from_classes(classes.into_values().collect());
        (assignments, demands, priorities, histogram)
    }

    #[test]
    fn test_full_demand_when_resources_cover_class() {
        let (mut a, d, p, h) = setup(&[(1, 6, 2.0, 3.0), (2, 4, 1.0, 2.0)]);
        // Plenty of spare resources: everyone gets full demand.
        adjust_assignments(&mut a, &d, &p, &h, 100.0);
        assert_eq!(a[&JobId(1)], 6.0);
        assert_eq!(a[&JobId(2)], 4.0);
    }

    #[test]
    fn test_no_addition_when_higher_class_consumes_all() {
        let (mut a, d, p, h) = setup(&[(1, 10, 2.0, 4.0), (2, 4, 1.0, 2.0)]);
        // Remaining 3 < still-demanded 6 of the high class: the low class
        // gains nothing.
        adjust_assignments(&mut a, &d, &p, &h, 3.0);
        assert_eq!(a[&JobId(2)], 2.0);
    }

    #[test]
    fn test_partial_share_is_proportional() {
        let (mut a, d, p, h) = setup(&[(1, 6, 2.0, 4.0), (2, 6, 1.0, 2.0)]);
        // High class still demands 2, low class 4 more (cumulative 6).
        // Remaining 4 ⇒ high class fully satisfied, low class gets
        // (4 − 2) / (6 − 2) = 1/2 of its missing share.
        adjust_assignments(&mut a, &d, &p, &h, 4.0);
        assert_eq!(a[&JobId(1)], 6.0);
        assert_eq!(a[&JobId(2)], 4.0);
    }

    #[test]
    fn test_atomic_jobs_untouched() {
        let (mut a, d, p, h) = setup(&[(1, 1, 1.0, 1.0)]);
        adjust_assignments(&mut a, &d, &p, &h, 0.0);
        assert_eq!(a[&JobId(1)], 1.0);
    }
}
