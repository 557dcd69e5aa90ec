use crate::{Error, common};

use serde::Serialize;
use serde_dynamo::to_attribute_value;

/// Key component.
///
/// ```rust
/// use dynamodb_fetch::common::key;
///
/// let key = key::Key {
///     name: "id".to_string(),
///     value: "1".to_string(),
/// };
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Key<T> {
    /// The attribute name of the key.
    pub name: String,
    /// The value of the key.
    pub value: T,
}

impl<T> Key<T> {
    /// Equality condition on this key, as used for the partition key of a query.
    pub fn equals(self) -> common::condition::ConditionExpression<T> {
        common::condition::ConditionExpression::leaf(
            self.name,
            common::condition::Condition::Equals(self.value),
        )
    }
}

/// Primary key (partition key and optional sort key).
///
/// ```rust
/// use dynamodb_fetch::common::key;
///
/// let keys = key::Keys {
///     partition_key: key::Key {
///         name: "id".to_string(),
///         value: "1".to_string(),
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Keys<T> {
    /// The partition key (required).
    pub partition_key: Key<T>,
    /// The sort key (optional, only for tables with composite primary keys).
    pub sort_key: Option<Key<T>>,
}

impl<T: Serialize> TryFrom<Keys<T>> for common::Item {
    type Error = Error;

    fn try_from(key: Keys<T>) -> Result<Self, Error> {
        let partition_key_value = to_attribute_value(key.partition_key.value)?;
        let mut item = Self::from([(key.partition_key.name, partition_key_value)]);
        if let Some(sort_key) = key.sort_key {
            let sort_key_value = to_attribute_value(sort_key.value)?;
            item.insert(sort_key.name, sort_key_value);
        }
        Ok(item)
    }
}

/// Converts typed keys into raw store keys, keeping their order.
pub fn to_items<T: Serialize>(
    keys: impl IntoIterator<Item = Keys<T>>,
) -> Result<Vec<common::Item>, Error> {
    keys.into_iter().map(common::Item::try_from).collect()
}
