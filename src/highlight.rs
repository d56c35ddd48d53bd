use serde::{Deserialize, Serialize};

use crate::operation::HighlightRange;
use crate::pipeline::BoundStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Input offsets to output offsets.
    Forward,
    /// Output offsets back to input offsets.
    Backward,
}

/// Maps byte ranges through every enabled step. `None` as soon as one step
/// cannot map, including any flow-control step.
pub fn map_ranges(
    steps: &[BoundStep],
    ranges: &[HighlightRange],
    direction: Direction,
) -> Option<Vec<HighlightRange>> {
    let mut order: Vec<&BoundStep> = steps.iter().filter(|step| !step.disabled).collect();
    if direction == Direction::Backward {
        order.reverse();
    }
    let mut current = ranges.to_vec();
    for step in order {
        if step.descriptor().flow_control {
            return None;
        }
        current = match direction {
            Direction::Forward => step.operation.highlight(&current, &step.args),
            Direction::Backward => step.operation.highlight_reverse(&current, &step.args),
        }?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Chef;
    use crate::recipe::Recipe;

    fn ranges(chef: &Chef, recipe: &Recipe, direction: Direction) -> Option<Vec<HighlightRange>> {
        let prepared = chef.prepare(recipe).unwrap();
        map_ranges(prepared.steps(), &[HighlightRange::new(1, 2)], direction)
    }

    #[test]
    fn maps_forward_and_back() {
        let chef = Chef::with_defaults();
        let recipe = Recipe::default()
            .then("To Upper case", ["All"])
            .then("To Hex", ["Space"]);
        assert_eq!(
            ranges(&chef, &recipe, Direction::Forward),
            Some(vec![HighlightRange::new(3, 5)])
        );
        let prepared = chef.prepare(&recipe).unwrap();
        assert_eq!(
            map_ranges(prepared.steps(), &[HighlightRange::new(3, 5)], Direction::Backward),
            Some(vec![HighlightRange::new(1, 2)])
        );
    }

    #[test]
    fn unmapped_or_flow_steps_give_none() {
        let chef = Chef::with_defaults();
        let with_hash = Recipe::default().then("SHA2", ["256"]);
        assert_eq!(ranges(&chef, &with_hash, Direction::Forward), None);
        let with_label = Recipe::default().then("Label", ["a"]);
        assert_eq!(ranges(&chef, &with_label, Direction::Forward), None);
        assert_eq!(
            ranges(&chef, &Recipe::default(), Direction::Backward),
            Some(vec![HighlightRange::new(1, 2)])
        );
    }
}
