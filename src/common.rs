//! Common utilities for DynamoDB operations.
//!
//! This module provides shared types and utilities used across read and write operations,
//! including expression compilation, key handling, attribute selection, chunking and rate
//! limiting.

/// Chunking of key and item lists into independent store calls.
pub mod chunk;

/// Condition expression compilation for filters, key conditions and conditional writes.
pub mod condition;

/// Key types for identifying items in DynamoDB tables.
pub mod key;

/// Attribute selection for projection expressions.
pub mod selection;

/// Capacity-unit rate limiting shared across fetchers.
pub mod token_bucket;

use aws_sdk_dynamodb::types;
use std::collections;

/// A raw DynamoDB item, as returned by the store.
pub type Item = collections::HashMap<String, types::AttributeValue>;

/// Running placeholder counter.
///
/// Carried through every recursive compilation step, and across clauses, so that a key
/// condition and a filter compiled in sequence never reuse a `#pN` or `:vN` index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Placeholders {
    names: usize,
    values: usize,
}

impl Placeholders {
    /// Starts counting names and values at the given offsets.
    pub fn starting_at(names: usize, values: usize) -> Self {
        Self { names, values }
    }

    /// Returns the next unused name index.
    pub fn names(&self) -> usize {
        self.names
    }

    /// Returns the next unused value index.
    pub fn values(&self) -> usize {
        self.values
    }

    pub(crate) fn next_name(&mut self) -> String {
        let placeholder = format!("#p{}", self.names);
        self.names += 1;
        placeholder
    }

    pub(crate) fn next_value(&mut self) -> String {
        let placeholder = format!(":v{}", self.values);
        self.values += 1;
        placeholder
    }
}

fn get_expression(left: String, operator: &str, right: String) -> String {
    if left.is_empty() {
        right
    } else if right.is_empty() {
        left
    } else {
        format!("{left}{operator}{right}")
    }
}

/// A compiled expression with its attribute name and value placeholders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpressionInput {
    /// The expression string, written with placeholders only.
    pub expression: String,
    /// Name placeholders (`#pN`) to attribute names.
    pub expression_attribute_names: collections::HashMap<String, String>,
    /// Value placeholders (`:vN`) to attribute values.
    pub expression_attribute_values: collections::HashMap<String, types::AttributeValue>,
}

impl ExpressionInput {
    pub(crate) fn merge(operator: &str, items: Vec<Self>) -> Self {
        let mut operation = Self::default();
        for item in items {
            operation.extend_placeholders(item.expression_attribute_names, item.expression_attribute_values);
            operation.expression = get_expression(operation.expression, operator, item.expression);
        }
        operation
    }

    /// Adds placeholders, keeping existing entries on conflict.
    pub(crate) fn extend_placeholders(
        &mut self,
        names: collections::HashMap<String, String>,
        values: collections::HashMap<String, types::AttributeValue>,
    ) {
        for (placeholder, name) in names {
            self.expression_attribute_names
                .entry(placeholder)
                .or_insert(name);
        }
        for (placeholder, value) in values {
            self.expression_attribute_values
                .entry(placeholder)
                .or_insert(value);
        }
    }

    pub(crate) fn merge_into(
        self,
        names: &mut Option<collections::HashMap<String, String>>,
        values: &mut Option<collections::HashMap<String, types::AttributeValue>>,
    ) -> String {
        if !self.expression_attribute_names.is_empty() {
            names
                .get_or_insert_with(collections::HashMap::new)
                .extend(self.expression_attribute_names);
        }
        if !self.expression_attribute_values.is_empty() {
            values
                .get_or_insert_with(collections::HashMap::new)
                .extend(self.expression_attribute_values);
        }
        self.expression
    }
}
