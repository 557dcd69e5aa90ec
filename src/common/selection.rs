use crate::common;

use indexmap::IndexMap;
use std::collections;

/// Separator between selected paths in a projection expression.
const PROJECTION_SEPARATOR: &str = ", ";

/// Map for selecting attributes in projection expressions.
///
/// ```rust
/// use dynamodb_fetch::common::selection;
///
/// let selection = selection::SelectionMap::Leaves(vec![
///     "id".to_string(),
///     "name".to_string(),
/// ]);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SelectionMap {
    /// Leaf selection - a flat list of attribute names to select.
    Leaves(Vec<String>),
    /// Node selection - nested selection for hierarchical attribute paths.
    Node(IndexMap<String, SelectionMap>),
}

impl From<SelectionMap> for common::ExpressionInput {
    fn from(selection_map: SelectionMap) -> Self {
        selection_map.compile(&mut common::Placeholders::default())
    }
}

impl SelectionMap {
    /// Compiles the selection into a projection expression.
    ///
    /// Name placeholders continue from `placeholders`, so a projection can share one
    /// attribute-name map with the key condition and filter of the same request.
    pub fn compile(&self, placeholders: &mut common::Placeholders) -> common::ExpressionInput {
        self.compile_under(&[], placeholders)
    }

    fn compile_under(
        &self,
        parents: &[String],
        placeholders: &mut common::Placeholders,
    ) -> common::ExpressionInput {
        let operations: Vec<_> = match self {
            Self::Leaves(leaves) => leaves
                .iter()
                .map(|leaf| {
                    let placeholder = placeholders.next_name();
                    let mut path = parents.to_vec();
                    path.push(placeholder.clone());
                    common::ExpressionInput {
                        expression: path.join("."),
                        expression_attribute_names: collections::HashMap::from([(
                            placeholder,
                            leaf.clone(),
                        )]),
                        ..Default::default()
                    }
                })
                .collect(),
            Self::Node(map) => map
                .iter()
                .map(|(key, value)| {
                    let placeholder = placeholders.next_name();
                    let mut path = parents.to_vec();
                    path.push(placeholder.clone());
                    let mut operation = value.compile_under(&path, placeholders);
                    operation
                        .expression_attribute_names
                        .insert(placeholder, key.clone());
                    operation
                })
                .collect(),
        };
        common::ExpressionInput::merge(PROJECTION_SEPARATOR, operations)
    }
}
