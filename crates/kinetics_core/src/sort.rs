use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Derived quantities that could not be placed in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Could not sort derived quantities. Check for circular or undefined references.\n\
     Unsorted: {unsorted:?}\nOrder: {order:?}"
)]
pub struct SortError {
    pub unsorted: Vec<String>,
    /// Order accepted before the resolver gave up.
    pub order: Vec<String>,
}

/// Orders `elements` so that each one's requirements are in `available` or
/// placed earlier.
///
/// Worklist in declaration order: the head is accepted when its
/// requirements are met and re-queued otherwise. Two consecutive re-queues
/// of the same name mean a full pass made no progress; more than `n²`
/// dequeues mean a cycle. Both end in a [`SortError`]. Accepted names are
/// added to `available`.
pub fn sort_dependencies(
    available: &mut HashSet<String>,
    elements: &[(String, HashSet<String>)],
) -> Result<Vec<String>, SortError> {
    let max_iterations = elements.len().pow(2);
    let mut queue: VecDeque<&(String, HashSet<String>)> = elements.iter().collect();
    let mut order = Vec::with_capacity(elements.len());
    let mut last_requeued: Option<&str> = None;
    let mut iterations = 0usize;

    while let Some(element) = queue.pop_front() {
        let (name, requires) = element;
        if requires.is_subset(available) {
            available.insert(name.clone());
            order.push(name.clone());
        } else if last_requeued == Some(name.as_str()) {
            let mut unsorted = vec![name.clone()];
            unsorted.extend(queue.iter().map(|(n, _)| n.clone()));
            return Err(SortError { unsorted, order });
        } else {
            queue.push_back(element);
            last_requeued = Some(name.as_str());
        }

        iterations += 1;
        if iterations > max_iterations {
            let unsorted = queue.iter().map(|(n, _)| n.clone()).collect();
            return Err(SortError { unsorted, order });
        }
    }

    Ok(order)
}
