//! Lowers a `facet::Shape` into an encoding [`Program`].
//!
//! The walk mirrors the value-side dispatch of the engine: special leaf
//! shapes first, then registered marshal hooks, then the shape's `Def`,
//! then its `Type`. Shapes currently being compiled sit on an ancestor
//! stack; re-entering one emits [`Instr::Recurse`] so recursive types
//! terminate.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, Utc};
use facet::{Def, Facet, Field, PointerType, Shape, StructKind, StructType, Type, UserType};
use facet_reflect::ScalarType;

use crate::error::Error;
use crate::marshal::{self, ShapeKey};
use crate::program::{
    EnumPlan, FieldKey, FieldPlan, Instr, MapKeyKind, MapPlan, MarshalPlan, PathStep, Program,
    StructPlan, VariantFieldPlan, VariantPlan, VariantShape,
};
use crate::raw::{Number, RawJson};

/// Compile-affecting inputs; part of the program-cache key.
///
/// The marshal-registry epoch is captured so that a program compiled before
/// a hook registration is never served afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CompileFlags {
    pub marshal_epoch: u32,
}

impl CompileFlags {
    pub(crate) fn current() -> Self {
        CompileFlags {
            marshal_epoch: marshal::epoch(),
        }
    }
}

/// Compiles a fresh program for `shape`.
pub(crate) fn compile(shape: &'static Shape<'static>) -> Result<Program, Error> {
    let mut compiler = Compiler { stack: Vec::new() };
    let root = compiler.instr_for(shape)?;
    Ok(Program { shape, root })
}

struct Compiler {
    /// Shapes currently being lowered, outermost first.
    stack: Vec<ShapeKey>,
}

impl Compiler {
    fn instr_for(&mut self, shape: &'static Shape<'static>) -> Result<Instr, Error> {
        if self.stack.contains(&ShapeKey::of(shape)) {
            return Ok(Instr::Recurse(shape));
        }

        // Dedicated leaves come before everything else; registered hooks
        // come before structural dispatch so a type can take over its own
        // rendering.
        if shape == Number::SHAPE {
            return Ok(Instr::NumberLiteral);
        }
        if shape == RawJson::SHAPE {
            return Ok(Instr::RawJson);
        }
        if shape.is_type::<DateTime<Utc>>() {
            return Ok(Instr::DateTimeUtc);
        }
        if shape.is_type::<DateTime<FixedOffset>>() {
            return Ok(Instr::DateTimeFixed);
        }
        if shape.is_type::<std::time::Duration>() {
            return Ok(Instr::Duration);
        }
        if let Some(hook) = marshal::probe(shape) {
            return Ok(Instr::Marshal(MarshalPlan { shape, hook }));
        }

        self.stack.push(ShapeKey::of(shape));
        let out = self.instr_for_inner(shape);
        self.stack.pop();
        out
    }

    fn instr_for_inner(&mut self, shape: &'static Shape<'static>) -> Result<Instr, Error> {
        if shape.inner.is_some() {
            if let Type::User(UserType::Struct(st)) = &shape.ty {
                if let Some(field) = st.fields.first() {
                    let inner = self.instr_for(field.shape())?;
                    return Ok(Instr::Transparent(Box::new(inner)));
                }
            }
        }

        // Raw pointers and function pointers have no JSON rendering.
        if let Type::Pointer(pt) = &shape.ty {
            match pt {
                PointerType::Raw(_) | PointerType::Function(_) => {
                    return Err(Error::UnsupportedType(shape));
                }
                PointerType::Reference(_) => {}
            }
        }

        match shape.def {
            Def::Scalar => self.scalar_instr(shape),
            Def::List(ld) => {
                if ld.t().is_type::<u8>() {
                    Ok(Instr::Bytes)
                } else {
                    Ok(Instr::Slice(Box::new(self.instr_for(ld.t())?)))
                }
            }
            Def::Slice(sd) => {
                if sd.t().is_type::<u8>() {
                    Ok(Instr::Bytes)
                } else {
                    Ok(Instr::Slice(Box::new(self.instr_for(sd.t())?)))
                }
            }
            Def::Array(ad) => {
                if ad.t().is_type::<u8>() {
                    Ok(Instr::ByteArray(ad.n))
                } else {
                    Ok(Instr::Array {
                        elem: Box::new(self.instr_for(ad.t())?),
                        len: ad.n,
                    })
                }
            }
            Def::Set(sd) => Ok(Instr::Set(Box::new(self.instr_for(sd.t())?))),
            Def::Map(md) => {
                let key = self.map_key_kind(md.k())?;
                let value = self.instr_for(md.v())?;
                Ok(Instr::Map(Box::new(MapPlan { key, value })))
            }
            Def::Option(od) => Ok(Instr::Option(Box::new(self.instr_for(od.t())?))),
            Def::Pointer(pd) => match pd.pointee() {
                Some(pointee) => Ok(Instr::Pointer(Box::new(self.instr_for(pointee)?))),
                None => Err(Error::UnsupportedType(shape)),
            },
            _ => self.user_instr(shape),
        }
    }

    fn scalar_instr(&mut self, shape: &'static Shape<'static>) -> Result<Instr, Error> {
        let instr = match ScalarType::try_from_shape(shape) {
            Some(ScalarType::Unit) => Instr::Unit,
            Some(ScalarType::Bool) => Instr::Bool,
            Some(ScalarType::Char) => Instr::Char,
            Some(ScalarType::Str | ScalarType::String | ScalarType::CowStr) => Instr::Str,
            Some(ScalarType::F32) => Instr::F32,
            Some(ScalarType::F64) => Instr::F64,
            Some(ScalarType::I8) => Instr::I8,
            Some(ScalarType::I16) => Instr::I16,
            Some(ScalarType::I32) => Instr::I32,
            Some(ScalarType::I64) => Instr::I64,
            Some(ScalarType::I128) => Instr::I128,
            Some(ScalarType::ISize) => Instr::Isize,
            Some(ScalarType::U8) => Instr::U8,
            Some(ScalarType::U16) => Instr::U16,
            Some(ScalarType::U32) => Instr::U32,
            Some(ScalarType::U64) => Instr::U64,
            Some(ScalarType::U128) => Instr::U128,
            Some(ScalarType::USize) => Instr::Usize,
            _ => return Err(Error::UnsupportedType(shape)),
        };
        Ok(instr)
    }

    fn user_instr(&mut self, shape: &'static Shape<'static>) -> Result<Instr, Error> {
        match &shape.ty {
            Type::User(UserType::Struct(st)) => match st.kind {
                StructKind::Unit => Ok(Instr::Unit),
                StructKind::Tuple | StructKind::TupleStruct => {
                    let mut elems = Vec::with_capacity(st.fields.len());
                    for field in st.fields {
                        elems.push(self.instr_for(field.shape())?);
                    }
                    Ok(Instr::Tuple(elems))
                }
                StructKind::Struct => {
                    let plan = self.struct_plan(st)?;
                    Ok(Instr::Struct(Box::new(plan)))
                }
            },
            Type::User(UserType::Enum(et)) => {
                let mut variants = Vec::with_capacity(et.variants.len());
                for variant in et.variants {
                    let kind = match variant.data.kind {
                        StructKind::Unit => VariantShape::Unit,
                        StructKind::Tuple | StructKind::TupleStruct
                            if variant.data.fields.len() == 1 =>
                        {
                            VariantShape::Newtype
                        }
                        StructKind::Tuple | StructKind::TupleStruct => VariantShape::Tuple,
                        StructKind::Struct => VariantShape::Struct,
                    };
                    let mut fields = Vec::with_capacity(variant.data.fields.len());
                    for field in variant.data.fields {
                        fields.push(VariantFieldPlan {
                            key: FieldKey::new(field.effective_name()),
                            instr: self.instr_for(field.shape())?,
                        });
                    }
                    variants.push(VariantPlan {
                        name: variant.name,
                        key: FieldKey::new(variant.name),
                        kind,
                        fields,
                    });
                }
                Ok(Instr::Enum(Box::new(EnumPlan { variants })))
            }
            _ => Err(Error::UnsupportedType(shape)),
        }
    }

    /// Key precedence: string kinds, then a registered text capability,
    /// then integer kinds. Everything else is rejected here, at compile
    /// time.
    fn map_key_kind(&mut self, key: &'static Shape<'static>) -> Result<MapKeyKind, Error> {
        match ScalarType::try_from_shape(key) {
            Some(ScalarType::Str | ScalarType::String | ScalarType::CowStr) => {
                return Ok(MapKeyKind::Str);
            }
            _ => {}
        }
        if let Some(hook) = marshal::probe_text(key) {
            return Ok(MapKeyKind::Text(MarshalPlan { shape: key, hook }));
        }
        match ScalarType::try_from_shape(key) {
            Some(
                ScalarType::I8
                | ScalarType::I16
                | ScalarType::I32
                | ScalarType::I64
                | ScalarType::I128
                | ScalarType::ISize,
            ) => Ok(MapKeyKind::Signed),
            Some(
                ScalarType::U8
                | ScalarType::U16
                | ScalarType::U32
                | ScalarType::U64
                | ScalarType::U128
                | ScalarType::USize,
            ) => Ok(MapKeyKind::Unsigned),
            _ => Err(Error::UnsupportedType(key)),
        }
    }

    fn struct_plan(&mut self, st: &StructType) -> Result<StructPlan, Error> {
        let mut visible = resolve_fields(st);
        // Output order follows the field-index sequence, so promoted
        // fields appear where their carrier was declared.
        visible.sort_by(|a, b| a.order.cmp(&b.order));

        let mut fields = Vec::with_capacity(visible.len());
        for candidate in visible {
            let instr = self.instr_for(candidate.shape)?;
            fields.push(FieldPlan {
                key: FieldKey::new(&candidate.name),
                name: candidate.name,
                path: candidate.path,
                instr,
                omitempty: candidate.omitempty,
                quoted: candidate.quoted,
            });
        }
        Ok(StructPlan { fields })
    }
}

struct Candidate {
    name: String,
    tagged: bool,
    depth: usize,
    path: Vec<PathStep>,
    order: Vec<usize>,
    shape: &'static Shape<'static>,
    omitempty: bool,
    quoted: bool,
}

/// A display name is invalid when it would need escaping inside the key
/// position of the original tag grammar; such fields are dropped.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['\\', '"', ','])
}

/// Breadth-first candidate enumeration through flattened fields, followed
/// by the dominance rules: minimum depth wins; among equal-depth candidates
/// a single explicitly renamed one wins; otherwise the name is hidden.
///
/// A struct flattened more than once at the same depth promotes nothing:
/// every one of its names would be ambiguous with itself. A struct already
/// expanded at a shallower depth is not expanded again; the shallow
/// occurrence dominates anyway.
fn resolve_fields(root: &StructType) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut visited: HashSet<ShapeKey> = HashSet::new();
    let mut level: Vec<(&StructType, Vec<PathStep>, Vec<usize>)> =
        vec![(root, Vec::new(), Vec::new())];
    let mut depth = 0;

    while !level.is_empty() {
        let mut next: Vec<(ShapeKey, &StructType, Vec<PathStep>, Vec<usize>)> = Vec::new();
        let mut counts: HashMap<ShapeKey, usize> = HashMap::new();

        for (st, prefix, order_prefix) in level.drain(..) {
            for (index, field) in st.fields.iter().enumerate() {
                if skipped(field) {
                    continue;
                }
                let mut path = prefix.clone();
                path.push(PathStep::Field(index));
                let mut order = order_prefix.clone();
                order.push(index);

                if field.is_flattened() {
                    if let Some((inner, steps)) = flatten_target(field.shape()) {
                        path.extend(steps);
                        let key = ShapeKey::of(flatten_shape(field.shape()));
                        *counts.entry(key).or_insert(0) += 1;
                        next.push((key, inner, path, order));
                        continue;
                    }
                    // A flattened non-struct keeps its own name, like any
                    // plain field.
                }

                let name = field.effective_name().to_owned();
                if !valid_name(&name) {
                    continue;
                }
                candidates.push(Candidate {
                    name,
                    tagged: field.rename.is_some(),
                    depth,
                    path,
                    order,
                    shape: field.shape(),
                    omitempty: field.has_builtin_attr("omitempty"),
                    quoted: field.has_builtin_attr("quoted"),
                });
            }
        }

        level = next
            .into_iter()
            .filter(|(key, _, _, _)| counts[key] == 1 && visited.insert(*key))
            .map(|(_, st, path, order)| (st, path, order))
            .collect();
        depth += 1;
    }

    dominant(candidates)
}

fn skipped(field: &Field) -> bool {
    use facet::FieldFlags;
    field.flags.contains(FieldFlags::SKIP) || field.flags.contains(FieldFlags::SKIP_SERIALIZING)
}

/// Follows `Option`/pointer layers of a flattened field down to a plain
/// struct, recording the dereference steps the engine must take.
fn flatten_target(shape: &'static Shape<'static>) -> Option<(&'static StructType, Vec<PathStep>)> {
    let mut steps = Vec::new();
    let mut current = shape;
    loop {
        match current.def {
            Def::Option(od) => {
                steps.push(PathStep::Deref);
                current = od.t();
            }
            Def::Pointer(pd) => {
                steps.push(PathStep::Deref);
                current = pd.pointee()?;
            }
            _ => break,
        }
    }
    match &current.ty {
        Type::User(UserType::Struct(st)) if st.kind == StructKind::Struct => Some((st, steps)),
        _ => None,
    }
}

/// The shape a flattened field ultimately promotes, used for cycle
/// detection during candidate enumeration.
fn flatten_shape(shape: &'static Shape<'static>) -> &'static Shape<'static> {
    let mut current = shape;
    loop {
        match current.def {
            Def::Option(od) => current = od.t(),
            Def::Pointer(pd) => match pd.pointee() {
                Some(p) => current = p,
                None => return current,
            },
            _ => return current,
        }
    }
}

fn dominant(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_name: HashMap<String, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        by_name.entry(candidate.name.clone()).or_default().push(candidate);
    }

    let mut visible = Vec::new();
    for (_, group) in by_name {
        let min_depth = group.iter().map(|c| c.depth).min().unwrap_or(0);
        let mut shallow: Vec<Candidate> =
            group.into_iter().filter(|c| c.depth == min_depth).collect();
        if shallow.len() == 1 {
            visible.push(shallow.pop().unwrap());
            continue;
        }
        let tagged: Vec<Candidate> = shallow.into_iter().filter(|c| c.tagged).collect();
        if tagged.len() == 1 {
            visible.extend(tagged);
        }
        // Two or more candidates at the same depth with the same
        // taggedness: the name is ambiguous and disappears.
    }
    visible
}
