use crate::{Error, common};

use aws_sdk_dynamodb::types;
use serde::Serialize;
use serde_dynamo::to_attribute_value;
use std::ops;

/// Separator for attribute path components.
const PATH_SEPARATOR: char = '.';

/// Separator used when a list literal is flattened into a single string.
const LIST_SEPARATOR: &str = ",";

/// Logical operator for combining conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogicalOperator {
    /// Logical AND - both conditions must be true.
    And,
    /// Logical OR - at least one condition must be true.
    Or,
    /// Logical NOT - the condition must be false.
    Not,
}

impl ops::Deref for LogicalOperator {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
            Self::Not => "NOT ",
        }
    }
}

/// Comparison operator between an attribute and another attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComparisonOperator {
    /// `=`
    Equals,
    /// `<>`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
}

impl ops::Deref for ComparisonOperator {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Equals => "=",
            Self::NotEqual => "<>",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
        }
    }
}

/// The left-hand side of a condition.
///
/// Paths are dotted attribute paths and may index into lists, e.g. `items[0].name`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Subject {
    /// The attribute at the path.
    Path(String),
    /// The size of the attribute at the path.
    Size(String),
}

impl From<&str> for Subject {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

impl From<String> for Subject {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

/// Condition types for DynamoDB expressions.
///
/// ```rust
/// use dynamodb_fetch::common::condition;
///
/// let eq = condition::Condition::Equals("value".to_string());
/// let gt = condition::Condition::GreaterThan(100);
/// let null: condition::Condition<String> = condition::Condition::Null;
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Condition<T> {
    /// Checks the DynamoDB type of an attribute (`S`, `N`, `L`, `M`, ...).
    AttributeType(String),
    /// Checks if an attribute begins with a specified prefix.
    BeginsWith(T),
    /// Checks if an attribute value is between two values (inclusive).
    Between(T, T),
    /// Compares an attribute with another attribute of the same item.
    ComparePath(ComparisonOperator, String),
    /// Checks if an attribute contains a specified value.
    Contains(T),
    /// Checks if an attribute value equals a specified value.
    Equals(T),
    /// Checks if an attribute value is greater than a specified value.
    GreaterThan(T),
    /// Checks if an attribute value is greater than or equal to a specified value.
    GreaterThanOrEqual(T),
    /// Checks if an attribute value is in a list of specified values.
    In(Vec<T>),
    /// Checks if an attribute value is less than a specified value.
    LessThan(T),
    /// Checks if an attribute value is less than or equal to a specified value.
    LessThanOrEqual(T),
    /// Checks if an attribute does not contain a specified value.
    NotContains(T),
    /// Checks if an attribute value does not equal a specified value.
    NotEqual(T),
    /// Checks if an attribute exists.
    NotNull,
    /// Checks if an attribute does not exist.
    Null,
}

/// Condition applied to an attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyCondition<T> {
    /// The condition to apply to the attribute.
    pub condition: Condition<T>,
    /// The attribute (or its size) the condition applies to.
    pub subject: Subject,
}

/// Structured condition, filter or key-condition expression.
///
/// Leaves hold a single [`KeyCondition`]; inner nodes combine sub-expressions with a
/// logical operator.
///
/// ```rust
/// use dynamodb_fetch::common::condition::{Condition, ConditionExpression};
///
/// let expression = ConditionExpression::leaf("status", Condition::Equals("active".to_string()))
///     .and(ConditionExpression::leaf("deleted_at", Condition::Null));
/// let compiled = expression.compile(&mut Default::default()).unwrap();
/// assert_eq!(compiled.expression, "#p0 = :v0 AND attribute_not_exists(#p1)");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum ConditionExpression<T> {
    /// A single condition.
    Leaf(KeyCondition<T>),
    /// Both sub-expressions must hold.
    And(Box<ConditionExpression<T>>, Box<ConditionExpression<T>>),
    /// At least one sub-expression must hold.
    Or(Box<ConditionExpression<T>>, Box<ConditionExpression<T>>),
    /// The sub-expression must not hold.
    Not(Box<ConditionExpression<T>>),
}

impl<T> ConditionExpression<T> {
    /// Creates a leaf condition on the given attribute path (or [`Subject::Size`]).
    pub fn leaf(subject: impl Into<Subject>, condition: Condition<T>) -> Self {
        Self::Leaf(KeyCondition {
            condition,
            subject: subject.into(),
        })
    }

    /// Combines this expression with another using AND.
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Combines this expression with another using OR.
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Negates this expression.
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Combines all expressions with AND, left to right. Returns `None` when empty.
    pub fn all(expressions: impl IntoIterator<Item = Self>) -> Option<Self> {
        expressions.into_iter().reduce(Self::and)
    }

    /// Returns the logical operator of an inner node, `None` for leaves.
    pub fn logical_operator(&self) -> Option<LogicalOperator> {
        match self {
            Self::Leaf(_) => None,
            Self::And(..) => Some(LogicalOperator::And),
            Self::Or(..) => Some(LogicalOperator::Or),
            Self::Not(_) => Some(LogicalOperator::Not),
        }
    }
}

impl<T: Serialize> TryFrom<ConditionExpression<T>> for common::ExpressionInput {
    type Error = Error;

    fn try_from(expression: ConditionExpression<T>) -> Result<Self, Error> {
        expression.compile(&mut common::Placeholders::default())
    }
}

impl<T: Serialize> ConditionExpression<T> {
    /// Compiles the expression into its wire form.
    ///
    /// Placeholders are allocated from `placeholders`, which is left pointing past the last
    /// index used, so further clauses can be compiled without collisions.
    pub fn compile(
        &self,
        placeholders: &mut common::Placeholders,
    ) -> Result<common::ExpressionInput, Error> {
        match self {
            Self::Leaf(key_condition) => key_condition.compile(placeholders),
            Self::And(left, right) | Self::Or(left, right) => {
                let left = left.compile_operand(placeholders)?;
                let right = right.compile_operand(placeholders)?;
                let operator = self.logical_operator().unwrap_or(LogicalOperator::And);
                Ok(common::ExpressionInput::merge(&operator, vec![left, right]))
            }
            Self::Not(operand) => {
                let mut operation = operand.compile_operand(placeholders)?;
                operation.expression = format!("{}{}", &*LogicalOperator::Not, operation.expression);
                Ok(operation)
            }
        }
    }

    fn compile_operand(
        &self,
        placeholders: &mut common::Placeholders,
    ) -> Result<common::ExpressionInput, Error> {
        let mut operation = self.compile(placeholders)?;
        if self.logical_operator().is_some() {
            operation.expression = format!("({})", operation.expression);
        }
        Ok(operation)
    }
}

impl<T: Serialize> KeyCondition<T> {
    pub(crate) fn compile(
        &self,
        placeholders: &mut common::Placeholders,
    ) -> Result<common::ExpressionInput, Error> {
        let mut operation = common::ExpressionInput::default();
        let subject = match &self.subject {
            Subject::Path(path) => compile_path(path, placeholders, &mut operation),
            Subject::Size(path) => {
                format!("size({})", compile_path(path, placeholders, &mut operation))
            }
        };
        operation.expression = match &self.condition {
            Condition::AttributeType(attribute_type) => {
                let value = types::AttributeValue::S(attribute_type.clone());
                let placeholder = insert_value(value, placeholders, &mut operation);
                format!("attribute_type({subject}, {placeholder})")
            }
            Condition::BeginsWith(prefix) => {
                let placeholder = compile_value(prefix, placeholders, &mut operation)?;
                format!("begins_with({subject}, {placeholder})")
            }
            Condition::Between(start, end) => {
                let start = compile_value(start, placeholders, &mut operation)?;
                let end = compile_value(end, placeholders, &mut operation)?;
                format!("{subject} BETWEEN {start} AND {end}")
            }
            Condition::ComparePath(operator, path) => {
                let other = compile_path(path, placeholders, &mut operation);
                format!("{subject} {} {other}", &**operator)
            }
            Condition::Contains(value) => {
                let placeholder = compile_value(value, placeholders, &mut operation)?;
                format!("contains({subject}, {placeholder})")
            }
            Condition::Equals(value) => {
                compile_comparison(subject, ComparisonOperator::Equals, value, placeholders, &mut operation)?
            }
            Condition::GreaterThan(value) => compile_comparison(
                subject,
                ComparisonOperator::GreaterThan,
                value,
                placeholders,
                &mut operation,
            )?,
            Condition::GreaterThanOrEqual(value) => compile_comparison(
                subject,
                ComparisonOperator::GreaterThanOrEqual,
                value,
                placeholders,
                &mut operation,
            )?,
            Condition::In(values) => {
                if values.is_empty() {
                    return Err(Error::configuration(format!(
                        "IN condition on {subject} needs at least one value"
                    )));
                }
                let mut value_placeholders = Vec::with_capacity(values.len());
                for value in values {
                    value_placeholders.push(compile_value(value, placeholders, &mut operation)?);
                }
                format!("{subject} IN ({})", value_placeholders.join(", "))
            }
            Condition::LessThan(value) => compile_comparison(
                subject,
                ComparisonOperator::LessThan,
                value,
                placeholders,
                &mut operation,
            )?,
            Condition::LessThanOrEqual(value) => compile_comparison(
                subject,
                ComparisonOperator::LessThanOrEqual,
                value,
                placeholders,
                &mut operation,
            )?,
            Condition::NotContains(value) => {
                let placeholder = compile_value(value, placeholders, &mut operation)?;
                format!("NOT contains({subject}, {placeholder})")
            }
            Condition::NotEqual(value) => compile_comparison(
                subject,
                ComparisonOperator::NotEqual,
                value,
                placeholders,
                &mut operation,
            )?,
            Condition::NotNull => format!("attribute_exists({subject})"),
            Condition::Null => format!("attribute_not_exists({subject})"),
        };
        Ok(operation)
    }
}

fn compile_comparison<T: Serialize>(
    subject: String,
    operator: ComparisonOperator,
    value: &T,
    placeholders: &mut common::Placeholders,
    operation: &mut common::ExpressionInput,
) -> Result<String, Error> {
    let placeholder = compile_value(value, placeholders, operation)?;
    Ok(format!("{subject} {} {placeholder}", &*operator))
}

/// Allocates one name placeholder per path segment; list indexes stay inline.
fn compile_path(
    path: &str,
    placeholders: &mut common::Placeholders,
    operation: &mut common::ExpressionInput,
) -> String {
    path.split(PATH_SEPARATOR)
        .map(|segment| {
            let (name, index) = segment.split_at(segment.find('[').unwrap_or(segment.len()));
            let placeholder = placeholders.next_name();
            operation
                .expression_attribute_names
                .insert(placeholder.clone(), name.to_string());
            format!("{placeholder}{index}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn compile_value<T: Serialize>(
    value: &T,
    placeholders: &mut common::Placeholders,
    operation: &mut common::ExpressionInput,
) -> Result<String, Error> {
    let value = coerce(to_attribute_value(value)?);
    Ok(insert_value(value, placeholders, operation))
}

fn insert_value(
    value: types::AttributeValue,
    placeholders: &mut common::Placeholders,
    operation: &mut common::ExpressionInput,
) -> String {
    let placeholder = placeholders.next_value();
    operation
        .expression_attribute_values
        .insert(placeholder.clone(), value);
    placeholder
}

/// Coerces a literal into a scalar attribute value.
///
/// Strings, numbers, booleans and binaries pass through. Lists and sets are flattened into
/// one comma-joined string. Null, maps and anything else become `BOOL(true)`.
pub(crate) fn coerce(value: types::AttributeValue) -> types::AttributeValue {
    match value {
        types::AttributeValue::S(_)
        | types::AttributeValue::N(_)
        | types::AttributeValue::Bool(_)
        | types::AttributeValue::B(_) => value,
        types::AttributeValue::L(values) => types::AttributeValue::S(
            values
                .iter()
                .map(scalar_text)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
        ),
        types::AttributeValue::Ss(values) | types::AttributeValue::Ns(values) => {
            types::AttributeValue::S(values.join(LIST_SEPARATOR))
        }
        _ => types::AttributeValue::Bool(true),
    }
}

fn scalar_text(value: &types::AttributeValue) -> String {
    match value {
        types::AttributeValue::S(text) | types::AttributeValue::N(text) => text.clone(),
        types::AttributeValue::Bool(flag) => flag.to_string(),
        types::AttributeValue::L(values) => values
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(LIST_SEPARATOR),
        types::AttributeValue::Ss(values) | types::AttributeValue::Ns(values) => {
            values.join(LIST_SEPARATOR)
        }
        _ => String::new(),
    }
}
