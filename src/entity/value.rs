use std::fmt;
use crate::entity::Primitive;
use crate::heap::ObjectReference;

/// A value as seen by the program: nothing, a scalar, or a reference into the
/// owning process's heap.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Entity {
    #[default]
    None,
    Primitive(Primitive),
    Object(ObjectReference),
}

impl Entity {
    /// The canonical "true" produced by comparisons and logical operators.
    pub const TRUE: Entity = Entity::Primitive(Primitive::Int(1));

    pub fn int(value: i64) -> Self {
        Entity::Primitive(Primitive::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Entity::Primitive(Primitive::Float(value))
    }

    pub fn char(value: i8) -> Self {
        Entity::Primitive(Primitive::Char(value))
    }

    /// `Int(1)` for true, `None` for false.
    pub fn from_bool(value: bool) -> Self {
        if value {
            Entity::TRUE
        } else {
            Entity::None
        }
    }

    /// Language truthiness: only `None` is false.
    pub fn is_truthy(&self) -> bool {
        !self.is_none()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Entity::None)
    }

    pub fn as_primitive(&self) -> Option<Primitive> {
        match self {
            Entity::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectReference> {
        match self {
            Entity::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    /// Short type description used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::None => "None",
            Entity::Primitive(p) => p.primitive_type().name(),
            Entity::Object(_) => "object",
        }
    }
}

impl From<Primitive> for Entity {
    fn from(value: Primitive) -> Self {
        Entity::Primitive(value)
    }
}

impl From<ObjectReference> for Entity {
    fn from(value: ObjectReference) -> Self {
        Entity::Object(value)
    }
}

impl From<i64> for Entity {
    fn from(value: i64) -> Self {
        Entity::int(value)
    }
}

impl From<f64> for Entity {
    fn from(value: f64) -> Self {
        Entity::float(value)
    }
}

/// Heap-free rendering; objects print as their reference. Use
/// [`crate::heap::render_entity`] to print objects through their class.
impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::None => write!(f, "None"),
            Entity::Primitive(p) => write!(f, "{}", p),
            Entity::Object(obj) => write!(f, "<{}>", obj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_none() {
        assert_eq!(Entity::default(), Entity::None);
        assert!(Entity::default().is_none());
    }

    #[test]
    fn test_truthiness_is_none_only() {
        assert!(!Entity::None.is_truthy());
        assert!(Entity::int(0).is_truthy());
        assert!(Entity::float(0.0).is_truthy());
        assert!(Entity::Object(ObjectReference::new(1, 1)).is_truthy());
    }

    #[test]
    fn test_from_bool() {
        assert_eq!(Entity::from_bool(true), Entity::int(1));
        assert_eq!(Entity::from_bool(false), Entity::None);
    }

    #[test]
    fn test_accessors() {
        let obj = ObjectReference::new(3, 7);
        assert_eq!(Entity::Object(obj).as_object(), Some(obj));
        assert_eq!(Entity::int(5).as_primitive(), Some(Primitive::Int(5)));
        assert_eq!(Entity::None.as_primitive(), None);
        assert_eq!(Entity::char(1).type_name(), "char");
        assert_eq!(Entity::None.type_name(), "None");
    }

    #[test]
    fn test_display() {
        assert_eq!(Entity::None.to_string(), "None");
        assert_eq!(Entity::int(42).to_string(), "42");
        assert_eq!(Entity::Object(ObjectReference::new(1, 2)).to_string(), "<Object@1:2>");
    }
}
