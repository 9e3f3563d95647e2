use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use crate::bytecode::{Instruction, Operand};
use crate::utils::KeyedList;

/// Errors raised while building or validating a tape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TapeError {
    #[error("Function '{name}' is already defined in {scope}")]
    DuplicateFunction { name: Arc<str>, scope: String },

    #[error("Class '{0}' is already defined")]
    DuplicateClass(Arc<str>),

    #[error("Cannot open class '{name}' while class '{open}' is still open")]
    NestedClass { open: Arc<str>, name: Arc<str> },

    #[error("No class is open")]
    NoOpenClass,

    #[error("No function is open")]
    NoOpenFunction,

    #[error("Class '{0}' was never closed")]
    UnclosedClass(Arc<str>),

    #[error("Instruction index {index} out of bounds (tape length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Source mapping table has {mappings} entries for {instructions} instructions")]
    SourceLengthMismatch { instructions: usize, mappings: usize },

    #[error("Class '{class}' has invalid range [{start}, {end})")]
    InvalidClassRange { class: Arc<str>, start: usize, end: usize },

    #[error("Classes '{first}' and '{second}' overlap")]
    OverlappingClasses { first: Arc<str>, second: Arc<str> },

    #[error("Method '{class}.{method}' entry {entry} lies outside its class range")]
    MethodOutOfRange { class: Arc<str>, method: Arc<str>, entry: usize },

    #[error("Function '{name}' entry {entry} lies inside class '{class}'")]
    FunctionInsideClass { name: Arc<str>, entry: usize, class: Arc<str> },
}

pub type TapeResult<T> = Result<T, TapeError>;

/// Source position of an instruction; `-1` marks an unknown coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub line: i32,
    pub column: i32,
}

impl SourceMapping {
    pub const NONE: SourceMapping = SourceMapping { line: -1, column: -1 };

    pub fn new(line: i32, column: i32) -> Self {
        Self { line, column }
    }

    pub fn is_known(&self) -> bool {
        self.line >= 0 || self.column >= 0
    }
}

impl Default for SourceMapping {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for SourceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "line {}, col {}", self.line, self.column)
        } else {
            write!(f, "unknown location")
        }
    }
}

/// Instruction window `[start, end)` of one class plus its method entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRef {
    pub start: usize,
    pub end: usize,
    pub parents: Vec<Arc<str>>,
    pub methods: KeyedList<usize>,
}

impl ClassRef {
    pub fn new(start: usize, end: usize, parents: Vec<Arc<str>>) -> Self {
        Self {
            start,
            end,
            parents,
            methods: KeyedList::new(),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.end
    }
}

/// Append-only program container.
///
/// Instructions are addressed by absolute position and never renumbered;
/// serialized tapes and function entries depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tape {
    instructions: Vec<Instruction>,
    source: Vec<SourceMapping>,
    func_refs: KeyedList<usize>,
    class_refs: KeyedList<ClassRef>,
    open_class: Option<usize>,
    open_function: Option<Arc<str>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a tape from already-indexed parts and check its invariants.
    pub fn from_parts(
        instructions: Vec<Instruction>,
        source: Vec<SourceMapping>,
        func_refs: KeyedList<usize>,
        class_refs: KeyedList<ClassRef>,
    ) -> TapeResult<Self> {
        let tape = Self {
            instructions,
            source,
            func_refs,
            class_refs,
            open_class: None,
            open_function: None,
        };
        tape.validate()?;
        Ok(tape)
    }

    /// Append an instruction, returning its position for later patching.
    pub fn append(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.source.push(SourceMapping::NONE);
        self.instructions.len() - 1
    }

    pub fn set_source(&mut self, position: usize, line: i32, column: i32) -> TapeResult<()> {
        let len = self.source.len();
        let slot = self
            .source
            .get_mut(position)
            .ok_or(TapeError::IndexOutOfBounds { index: position, len })?;
        *slot = SourceMapping::new(line, column);
        Ok(())
    }

    /// Replace the operand of an already appended instruction.
    pub fn patch(&mut self, position: usize, operand: Operand) -> TapeResult<()> {
        let len = self.instructions.len();
        let instruction = self
            .instructions
            .get_mut(position)
            .ok_or(TapeError::IndexOutOfBounds { index: position, len })?;
        instruction.operand = operand;
        Ok(())
    }

    /// Register a function whose entry is the next appended instruction.
    ///
    /// Inside an open class the function becomes a method of that class.
    pub fn begin_function(&mut self, name: impl Into<Arc<str>>) -> TapeResult<usize> {
        let name = name.into();
        let entry = self.instructions.len();
        let inserted = match self.open_class {
            Some(class_index) => {
                let (class_name, class) = self
                    .class_refs
                    .get_index_mut(class_index)
                    .ok_or(TapeError::NoOpenClass)?;
                let class_name = class_name.clone();
                class.methods.insert(name.clone(), entry).map_err(|_| {
                    TapeError::DuplicateFunction {
                        name: name.clone(),
                        scope: format!("class '{}'", class_name),
                    }
                })
            }
            None => self.func_refs.insert(name.clone(), entry).map_err(|_| {
                TapeError::DuplicateFunction {
                    name: name.clone(),
                    scope: "module scope".to_string(),
                }
            }),
        };
        inserted?;
        self.open_function = Some(name);
        Ok(entry)
    }

    pub fn end_function(&mut self) -> TapeResult<Arc<str>> {
        self.open_function.take().ok_or(TapeError::NoOpenFunction)
    }

    pub fn begin_class(&mut self, name: impl Into<Arc<str>>, parents: Vec<Arc<str>>) -> TapeResult<()> {
        let name = name.into();
        if let Some((open, _)) = self.open_class.and_then(|index| self.class_refs.get_index(index)) {
            return Err(TapeError::NestedClass {
                open: open.clone(),
                name,
            });
        }
        let start = self.instructions.len();
        let index = self
            .class_refs
            .insert(name.clone(), ClassRef::new(start, start, parents))
            .map_err(|_| TapeError::DuplicateClass(name))?;
        self.open_class = Some(index);
        self.open_function = None;
        Ok(())
    }

    pub fn end_class(&mut self) -> TapeResult<Arc<str>> {
        let index = self.open_class.take().ok_or(TapeError::NoOpenClass)?;
        let end = self.instructions.len();
        let (name, class) = self
            .class_refs
            .get_index_mut(index)
            .ok_or(TapeError::NoOpenClass)?;
        class.end = end;
        self.open_function = None;
        Ok(name.clone())
    }

    /// Name of the class currently being emitted, if any.
    pub fn open_class(&self) -> Option<&Arc<str>> {
        self.open_class
            .and_then(|index| self.class_refs.get_index(index))
            .map(|(name, _)| name)
    }

    pub fn instruction(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Mapping for an instruction; out-of-range positions are unknown.
    pub fn source(&self, index: usize) -> SourceMapping {
        self.source.get(index).copied().unwrap_or_default()
    }

    pub fn source_mappings(&self) -> &[SourceMapping] {
        &self.source
    }

    pub fn has_source_mappings(&self) -> bool {
        self.source.iter().any(SourceMapping::is_known)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn functions(&self) -> &KeyedList<usize> {
        &self.func_refs
    }

    pub fn function_entry(&self, name: &str) -> Option<usize> {
        self.func_refs.get(name).copied()
    }

    pub fn classes(&self) -> &KeyedList<ClassRef> {
        &self.class_refs
    }

    pub fn class(&self, name: &str) -> Option<&ClassRef> {
        self.class_refs.get(name)
    }

    /// Check the structural invariants: source table length, class ranges
    /// ordered and disjoint, method entries inside their class, top-level
    /// entries outside every class.
    pub fn validate(&self) -> TapeResult<()> {
        if let Some(open) = self.open_class() {
            return Err(TapeError::UnclosedClass(open.clone()));
        }
        let len = self.instructions.len();
        if self.source.len() != len {
            return Err(TapeError::SourceLengthMismatch {
                instructions: len,
                mappings: self.source.len(),
            });
        }

        let mut ranges: Vec<(&Arc<str>, &ClassRef)> = self.class_refs.iter().collect();
        ranges.sort_by_key(|(_, class)| (class.start, class.end));
        for (name, class) in &ranges {
            if class.start > class.end || class.end > len {
                return Err(TapeError::InvalidClassRange {
                    class: (*name).clone(),
                    start: class.start,
                    end: class.end,
                });
            }
            for (method, &entry) in class.methods.iter() {
                if !class.contains(entry) {
                    return Err(TapeError::MethodOutOfRange {
                        class: (*name).clone(),
                        method: method.clone(),
                        entry,
                    });
                }
            }
        }
        for pair in ranges.windows(2) {
            let (first, a) = pair[0];
            let (second, b) = pair[1];
            if b.start < a.end {
                return Err(TapeError::OverlappingClasses {
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        }

        for (name, &entry) in self.func_refs.iter() {
            if entry > len {
                return Err(TapeError::IndexOutOfBounds { index: entry, len });
            }
            if let Some((class, _)) = ranges.iter().find(|(_, class)| class.contains(entry)) {
                return Err(TapeError::FunctionInsideClass {
                    name: name.clone(),
                    entry,
                    class: (*class).clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;

    fn push(value: i64) -> Instruction {
        Instruction::new(Op::Push).with_int(value)
    }

    #[test]
    fn test_append_keeps_source_in_lock_step() {
        let mut tape = Tape::new();
        assert_eq!(tape.append(push(1)), 0);
        assert_eq!(tape.append(Instruction::new(Op::Ret)), 1);
        assert_eq!(tape.source_mappings().len(), 2);
        assert_eq!(tape.source(1), SourceMapping::NONE);

        tape.set_source(1, 4, 2).unwrap();
        assert_eq!(tape.source(1), SourceMapping::new(4, 2));
        assert_eq!(tape.source(0), SourceMapping::NONE);
        assert!(tape.has_source_mappings());
        assert!(matches!(
            tape.set_source(2, 1, 1),
            Err(TapeError::IndexOutOfBounds { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_instruction_lookup_is_bounds_checked() {
        let mut tape = Tape::new();
        tape.append(push(7));
        assert_eq!(tape.instruction(0), Some(&push(7)));
        assert_eq!(tape.instruction(1), None);
    }

    #[test]
    fn test_patch_rewrites_operand() {
        let mut tape = Tape::new();
        let jump = tape.append(Instruction::new(Op::Ifn));
        tape.append(push(1));
        tape.patch(jump, Operand::Primitive(2i64.into())).unwrap();
        assert_eq!(tape.instruction(jump).and_then(|i| i.operand.int()), Some(2));
        assert!(tape.patch(9, Operand::None).is_err());
    }

    #[test]
    fn test_function_entry_is_current_length() {
        let mut tape = Tape::new();
        tape.append(Instruction::new(Op::Nop));
        assert_eq!(tape.begin_function("main").unwrap(), 1);
        tape.append(Instruction::new(Op::Ret));
        assert_eq!(tape.end_function().unwrap().as_ref(), "main");
        assert_eq!(tape.function_entry("main"), Some(1));
        assert_eq!(tape.end_function(), Err(TapeError::NoOpenFunction));
    }

    #[test]
    fn test_duplicate_function_keeps_original_binding() {
        let mut tape = Tape::new();
        tape.begin_function("f").unwrap();
        tape.append(Instruction::new(Op::Ret));
        tape.end_function().unwrap();

        let err = tape.begin_function("f").unwrap_err();
        assert!(matches!(err, TapeError::DuplicateFunction { .. }));
        assert_eq!(tape.function_entry("f"), Some(0));
        assert_eq!(tape.functions().len(), 1);
    }

    #[test]
    fn test_method_scope_is_per_class() {
        let mut tape = Tape::new();
        tape.begin_function("foo").unwrap();
        tape.append(Instruction::new(Op::Ret));

        tape.begin_class("A", vec![]).unwrap();
        tape.begin_function("foo").unwrap();
        tape.append(Instruction::new(Op::Ret));
        assert!(matches!(
            tape.begin_function("foo"),
            Err(TapeError::DuplicateFunction { .. })
        ));
        tape.end_class().unwrap();

        tape.begin_class("B", vec!["A".into()]).unwrap();
        tape.begin_function("foo").unwrap();
        tape.append(Instruction::new(Op::Ret));
        tape.end_class().unwrap();

        assert_eq!(tape.function_entry("foo"), Some(0));
        assert_eq!(tape.class("A").and_then(|c| c.methods.get("foo")).copied(), Some(1));
        assert_eq!(tape.class("B").and_then(|c| c.methods.get("foo")).copied(), Some(2));
        assert_eq!(tape.class("B").map(|c| c.parents.clone()), Some(vec![Arc::from("A")]));
        tape.validate().unwrap();
    }

    #[test]
    fn test_nested_and_unbalanced_classes_rejected() {
        let mut tape = Tape::new();
        assert_eq!(tape.end_class(), Err(TapeError::NoOpenClass));

        tape.begin_class("Outer", vec![]).unwrap();
        assert!(matches!(
            tape.begin_class("Inner", vec![]),
            Err(TapeError::NestedClass { .. })
        ));
        assert_eq!(tape.open_class().map(|n| n.as_ref()), Some("Outer"));
        assert!(matches!(tape.validate(), Err(TapeError::UnclosedClass(_))));
        tape.end_class().unwrap();

        assert!(matches!(
            tape.begin_class("Outer", vec![]),
            Err(TapeError::DuplicateClass(_))
        ));
    }

    #[test]
    fn test_class_ranges_are_disjoint_windows() {
        let mut tape = Tape::new();
        for name in ["A", "B", "C"] {
            tape.begin_class(name, vec![]).unwrap();
            tape.begin_function("m").unwrap();
            tape.append(push(1));
            tape.append(Instruction::new(Op::Ret));
            tape.end_class().unwrap();
        }
        tape.validate().unwrap();

        let classes: Vec<&ClassRef> = tape.classes().values().collect();
        for class in &classes {
            assert!(class.start <= class.end);
            for &entry in class.methods.values() {
                assert!(class.contains(entry));
            }
        }
        for pair in classes.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn test_from_parts_rejects_broken_invariants() {
        let instructions = vec![push(1), push(2), Instruction::new(Op::Ret)];
        let source = vec![SourceMapping::NONE; 3];

        let mut classes = KeyedList::new();
        classes.insert("A", ClassRef::new(0, 2, vec![])).unwrap();
        classes.insert("B", ClassRef::new(1, 3, vec![])).unwrap();
        let err = Tape::from_parts(instructions.clone(), source.clone(), KeyedList::new(), classes)
            .unwrap_err();
        assert!(matches!(err, TapeError::OverlappingClasses { .. }));

        let mut classes = KeyedList::new();
        let mut class = ClassRef::new(0, 1, vec![]);
        class.methods.insert("m", 2).unwrap();
        classes.insert("A", class).unwrap();
        let err = Tape::from_parts(instructions.clone(), source.clone(), KeyedList::new(), classes)
            .unwrap_err();
        assert!(matches!(err, TapeError::MethodOutOfRange { entry: 2, .. }));

        let mut classes = KeyedList::new();
        classes.insert("A", ClassRef::new(0, 2, vec![])).unwrap();
        let mut funcs = KeyedList::new();
        funcs.insert("f", 1).unwrap();
        let err = Tape::from_parts(instructions.clone(), source.clone(), funcs, classes).unwrap_err();
        assert!(matches!(err, TapeError::FunctionInsideClass { entry: 1, .. }));

        let err = Tape::from_parts(instructions, vec![], KeyedList::new(), KeyedList::new()).unwrap_err();
        assert!(matches!(err, TapeError::SourceLengthMismatch { .. }));
    }
}
