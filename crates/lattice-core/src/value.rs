//! value.rs — le modèle de valeurs de Lattice : la variante taguée qui porte
//! toute donnée de première classe manipulée par la VM.
//!
//! Deux notions de copie coexistent volontairement :
//! - `Clone` (dérivable, bon marché) duplique le `Value` lui-même ; pour les
//!   types à charge possédée (Array, Map, Set, Struct, Buffer) cela ne fait
//!   que faire monter un compteur de référence `Arc` — exactement ce dont la
//!   VM a besoin pour dupliquer une entrée de pile (les conteneurs sont des
//!   types référence dans Lattice, comme dans la plupart des langages
//!   dynamiques : une affectation alias, elle ne copie pas).
//! - [`Value::deep_clone`] implémente le contrat "Clone : copie profonde" du
//!   §4.1 : il matérialise une structure entièrement neuve, récursivement.
//!   C'est l'opération que le builtin/compilateur `clone()` invoque.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::chunk::Chunk;
use crate::error::{FaultKind, LatticeError, Result};
use crate::vm::Vm;

/// Tag de phase — contrat de mutabilité consultatif vérifié par le
/// compilateur ; la VM le porte sans jamais l'interpréter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Unphased,
    Fluid,
    Crystal,
}

/// Identifiant de région, pour une gestion mémoire par région future.
/// `RegionId::NONE` est la valeur par défaut ("aucune région").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionId(pub u32);

impl RegionId {
    pub const NONE: RegionId = RegionId(0);
}

/// Fonction native: reçoit la VM appelante et la tranche d'arguments, rend
/// une valeur ou une faute d'exécution. Voir `runtime::registry`.
pub type NativeFn = Arc<dyn Fn(&mut Vm, &[Value]) -> Result<Value> + Send + Sync>;

/// Séquence paresseuse produite par un itérateur. Non redémarrable : `next`
/// avance un état interne. Doit être `Send + Sync` car une Value peut en
/// théorie transiter vers une VM ouvrière via l'environnement cloné — en
/// pratique les itérateurs ne sont pas partagés, mais le type doit rester
/// transportable pour que `Value` lui-même le soit.
pub trait LatticeIterator: Send + Sync {
    fn next_value(&mut self) -> Option<Value>;
}

#[derive(Debug)]
pub struct ClosureObj {
    pub param_count: u32,
    pub param_names: Option<Vec<Arc<str>>>,
    pub variadic: bool,
    pub defaults: Vec<Value>,
    pub body: Option<Arc<Chunk>>,
    pub upvalues: Vec<Arc<crate::vm::upvalue::Upvalue>>,
    pub native: Option<NativeFn>,
    pub name: Option<Arc<str>>,
}

impl ClosureObj {
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

// `ClosureObj` can't derive `Clone` because `NativeFn` is a trait object; a
// manual impl just clones the `Arc`s, which is correct (closures have
// pointer identity at the `Value` layer; this impl only exists so
// `ClosureObj` itself is movable when constructing a fresh `Arc`).
impl Clone for ClosureObj {
    fn clone(&self) -> Self {
        Self {
            param_count: self.param_count,
            param_names: self.param_names.clone(),
            variadic: self.variadic,
            defaults: self.defaults.clone(),
            body: self.body.clone(),
            upvalues: self.upvalues.clone(),
            native: self.native.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructObj {
    pub type_name: Arc<str>,
    pub fields: Vec<(Arc<str>, Value)>,
}

impl StructObj {
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> bool {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| &**n == name) {
            slot.1 = value;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnumObj {
    pub enum_name: Arc<str>,
    pub variant_name: Arc<str>,
    pub payload: Option<Vec<Value>>,
}

/// Sous-ensemble hashable de `Value`, utilisé comme clé dans `Set`. Les
/// conteneurs (Array, Map, Struct, ...) n'y sont volontairement pas
/// représentables : leur insertion dans un `Set` échoue avec une
/// `FaultKind::TypeError` au lieu de hasher une structure mutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SetKey {
    Int(i64),
    FloatBits(u64),
    Bool(bool),
    Str(Arc<str>),
    Nil,
    Unit,
}

impl SetKey {
    fn try_from_value(v: &Value) -> Option<SetKey> {
        match v {
            Value::Int(i) => Some(SetKey::Int(*i)),
            Value::Float(f) => Some(SetKey::FloatBits(f.to_bits())),
            Value::Bool(b) => Some(SetKey::Bool(*b)),
            Value::String(s) => Some(SetKey::Str(s.clone())),
            Value::Nil => Some(SetKey::Nil),
            Value::Unit => Some(SetKey::Unit),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            SetKey::Int(i) => Value::int(*i),
            SetKey::FloatBits(bits) => Value::float(f64::from_bits(*bits)),
            SetKey::Bool(b) => Value::bool(*b),
            SetKey::Str(s) => Value::String(s.clone()),
            SetKey::Nil => Value::Nil,
            SetKey::Unit => Value::Unit,
        }
    }
}

#[derive(Debug, Default)]
pub struct SetObj {
    pub entries: ahash::AHashSet<SetKey>,
}

impl SetObj {
    pub fn insert(&mut self, v: &Value) -> Result<bool> {
        let key = SetKey::try_from_value(v).ok_or_else(|| {
            LatticeError::from(FaultKind::TypeError { expected: "hashable value", found: v.value_kind().name() })
        })?;
        Ok(self.entries.insert(key))
    }

    pub fn contains(&self, v: &Value) -> bool {
        match SetKey::try_from_value(v) {
            Some(key) => self.entries.contains(&key),
            None => false,
        }
    }

    pub fn iter_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().map(SetKey::to_value)
    }
}

impl Clone for SetObj {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatRange {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl LatRange {
    pub fn len(&self) -> usize {
        if self.step == 0 {
            return 0;
        }
        if self.step > 0 {
            if self.end <= self.start {
                return 0;
            }
            ((self.end - self.start) as i64 / self.step) as usize
        } else {
            if self.end >= self.start {
                return 0;
            }
            ((self.start - self.end) as i64 / (-self.step)) as usize
        }
    }
}

pub struct ChannelObj {
    pub sender: crossbeam_channel::Sender<Value>,
    pub receiver: crossbeam_channel::Receiver<Value>,
    pub capacity: usize,
}

impl fmt::Debug for ChannelObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel(cap={})", self.capacity)
    }
}

/// Le modèle de valeurs de Lattice. Chaque variante à charge possédée est
/// protégée par un `Arc` (identité/partage) combiné, pour les conteneurs
/// mutables, à un `RwLock` interne (mutation en place, §4.1 "interior
/// mutability via index/assign").
#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Unit,
    String(Arc<str>),
    Array(Arc<RwLock<Vec<Value>>>),
    Tuple(Arc<[Value]>),
    Set(Arc<RwLock<SetObj>>),
    Map(Arc<RwLock<AHashMap<Arc<str>, Value>>>),
    Struct(Arc<RwLock<StructObj>>),
    Enum(Arc<EnumObj>),
    Range(LatRange),
    Buffer(Arc<RwLock<Vec<u8>>>),
    Channel(Arc<ChannelObj>),
    Ref(Arc<RwLock<Value>>),
    /// Boxed rather than a bare `Arc<Mutex<dyn LatticeIterator>>` so that
    /// building one from a concrete driver (`vm::iter::ArrayIter`, ...) is a
    /// plain sized `Mutex::new(Box::new(driver))` — no unsized-coercion
    /// dance through the lock type.
    Iterator(Arc<Mutex<Box<dyn LatticeIterator>>>),
    Closure(Arc<ClosureObj>),
}

/// Discriminant léger pour des tests de type rapides sans matcher la charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Nil,
    Unit,
    String,
    Array,
    Tuple,
    Set,
    Map,
    Struct,
    Enum,
    Range,
    Buffer,
    Channel,
    Ref,
    Iterator,
    Closure,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Int => "Int",
            ValueKind::Float => "Float",
            ValueKind::Bool => "Bool",
            ValueKind::Nil => "Nil",
            ValueKind::Unit => "Unit",
            ValueKind::String => "String",
            ValueKind::Array => "Array",
            ValueKind::Tuple => "Tuple",
            ValueKind::Set => "Set",
            ValueKind::Map => "Map",
            ValueKind::Struct => "Struct",
            ValueKind::Enum => "Enum",
            ValueKind::Range => "Range",
            ValueKind::Buffer => "Buffer",
            ValueKind::Channel => "Channel",
            ValueKind::Ref => "Ref",
            ValueKind::Iterator => "Iterator",
            ValueKind::Closure => "Closure",
        }
    }
}

impl Value {
    pub fn int(v: i64) -> Value {
        Value::Int(v)
    }

    pub fn float(v: f64) -> Value {
        Value::Float(v)
    }

    pub fn bool(v: bool) -> Value {
        Value::Bool(v)
    }

    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::from(items))
    }

    pub fn buffer(bytes: Vec<u8>) -> Value {
        Value::Buffer(Arc::new(RwLock::new(bytes)))
    }

    pub fn new_ref(initial: Value) -> Value {
        Value::Ref(Arc::new(RwLock::new(initial)))
    }

    /// Builds a fresh bounded-FIFO channel (§4.1, §5 "Channels are bounded
    /// FIFOs"). `capacity` 0 yields a rendezvous channel: `channel_send`
    /// blocks until a `channel_recv` is waiting to take the value.
    pub fn new_channel(capacity: usize) -> Value {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Value::Channel(Arc::new(ChannelObj { sender, receiver, capacity }))
    }

    pub fn value_kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::Nil => ValueKind::Nil,
            Value::Unit => ValueKind::Unit,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Tuple(_) => ValueKind::Tuple,
            Value::Set(_) => ValueKind::Set,
            Value::Map(_) => ValueKind::Map,
            Value::Struct(_) => ValueKind::Struct,
            Value::Enum(_) => ValueKind::Enum,
            Value::Range(_) => ValueKind::Range,
            Value::Buffer(_) => ValueKind::Buffer,
            Value::Channel(_) => ValueKind::Channel,
            Value::Ref(_) => ValueKind::Ref,
            Value::Iterator(_) => ValueKind::Iterator,
            Value::Closure(_) => ValueKind::Closure,
        }
    }

    /// Numeric coercion to `f64` used by the arithmetic family (§4.4.2):
    /// Int promotes, Float passes through, anything else is a type error.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(LatticeError::from(FaultKind::TypeError {
                expected: "number",
                found: other.value_kind().name(),
            })),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(LatticeError::from(FaultKind::TypeError {
                expected: "Int",
                found: other.value_kind().name(),
            })),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Nil => false,
            Value::Unit => false,
            Value::Int(i) => *i != 0,
            _ => true,
        }
    }

    /// Copie profonde récursive, per §4.1. `Channel`/`Iterator` ne sont pas
    /// clonables et remontent une faute.
    pub fn deep_clone(&self) -> Result<Value> {
        Ok(match self {
            Value::Int(_)
            | Value::Float(_)
            | Value::Bool(_)
            | Value::Nil
            | Value::Unit
            | Value::String(_)
            | Value::Range(_) => self.clone(),
            Value::Array(a) => {
                let guard = a.read();
                let mut out = Vec::with_capacity(guard.len());
                for v in guard.iter() {
                    out.push(v.deep_clone()?);
                }
                Value::array(out)
            }
            Value::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for v in items.iter() {
                    out.push(v.deep_clone()?);
                }
                Value::tuple(out)
            }
            Value::Set(s) => {
                let guard = s.read();
                Value::Set(Arc::new(RwLock::new(guard.clone())))
            }
            Value::Map(m) => {
                let guard = m.read();
                let mut out = AHashMap::with_capacity(guard.len());
                for (k, v) in guard.iter() {
                    out.insert(k.clone(), v.deep_clone()?);
                }
                Value::Map(Arc::new(RwLock::new(out)))
            }
            Value::Struct(s) => {
                let guard = s.read();
                let mut fields = Vec::with_capacity(guard.fields.len());
                for (name, v) in &guard.fields {
                    fields.push((name.clone(), v.deep_clone()?));
                }
                Value::Struct(Arc::new(RwLock::new(StructObj { type_name: guard.type_name.clone(), fields })))
            }
            Value::Enum(e) => {
                let payload = match &e.payload {
                    Some(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for v in items {
                            out.push(v.deep_clone()?);
                        }
                        Some(out)
                    }
                    None => None,
                };
                Value::Enum(Arc::new(EnumObj {
                    enum_name: e.enum_name.clone(),
                    variant_name: e.variant_name.clone(),
                    payload,
                }))
            }
            Value::Buffer(b) => Value::buffer(b.read().clone()),
            Value::Ref(r) => {
                let inner = r.read().deep_clone()?;
                Value::new_ref(inner)
            }
            Value::Channel(_) => {
                return Err(LatticeError::from(FaultKind::TypeError {
                    expected: "clonable value",
                    found: "Channel",
                }))
            }
            Value::Iterator(_) => {
                return Err(LatticeError::from(FaultKind::TypeError {
                    expected: "clonable value",
                    found: "Iterator",
                }))
            }
            Value::Closure(c) => Value::Closure(c.clone()),
        })
    }

    /// Égalité structurelle du §4.1. `Ref`/`Channel`/`Iterator`/`Closure`
    /// comparent par identité de pointeur.
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Unit, Value::Unit) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                let (ga, gb) = (a.read(), b.read());
                ga.len() == gb.len() && ga.iter().zip(gb.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Value::Set(a), Value::Set(b)) => {
                let (ga, gb) = (a.read(), b.read());
                ga.entries.len() == gb.entries.len() && ga.entries.iter().all(|k| gb.entries.contains(k))
            }
            (Value::Map(a), Value::Map(b)) => {
                let (ga, gb) = (a.read(), b.read());
                ga.len() == gb.len()
                    && ga.iter().all(|(k, v)| gb.get(k).is_some_and(|ov| v.value_eq(ov)))
            }
            (Value::Struct(a), Value::Struct(b)) => {
                let (ga, gb) = (a.read(), b.read());
                ga.type_name == gb.type_name
                    && ga.fields.len() == gb.fields.len()
                    && ga.fields.iter().all(|(name, v)| {
                        gb.get_field(name).is_some_and(|ov| v.value_eq(ov))
                    })
            }
            (Value::Enum(a), Value::Enum(b)) => {
                a.enum_name == b.enum_name
                    && a.variant_name == b.variant_name
                    && match (&a.payload, &b.payload) {
                        (None, None) => true,
                        (Some(pa), Some(pb)) => {
                            pa.len() == pb.len() && pa.iter().zip(pb.iter()).all(|(x, y)| x.value_eq(y))
                        }
                        _ => false,
                    }
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => *a.read() == *b.read(),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Nil => write!(f, "nil"),
            Value::Unit => write!(f, "()"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(a) => {
                let guard = a.read();
                write!(f, "[")?;
                for (i, v) in guard.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Set(s) => {
                let guard = s.read();
                write!(f, "{{")?;
                for (i, v) in guard.iter_values().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Value::Map(m) => {
                let guard = m.read();
                write!(f, "{{")?;
                for (i, (k, v)) in guard.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct(s) => {
                let guard = s.read();
                write!(f, "{} {{ ", guard.type_name)?;
                for (i, (name, v)) in guard.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {v}")?;
                }
                write!(f, " }}")
            }
            Value::Enum(e) => match &e.payload {
                None => write!(f, "{}::{}", e.enum_name, e.variant_name),
                Some(items) => {
                    write!(f, "{}::{}(", e.enum_name, e.variant_name)?;
                    for (i, v) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    write!(f, ")")
                }
            },
            Value::Range(r) => write!(f, "{}..{}", r.start, r.end),
            Value::Buffer(b) => write!(f, "<buffer {} bytes>", b.read().len()),
            Value::Channel(c) => write!(f, "<channel cap={}>", c.capacity),
            Value::Ref(r) => write!(f, "<ref {}>", r.read()),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Closure(c) => match &c.name {
                Some(name) => write!(f, "<fn {name}>"),
                None => write!(f, "<fn anonymous>"),
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_value_repr_contract() {
        assert_eq!(Value::int(7).to_string(), "7");
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Unit.to_string(), "()");
        assert_eq!(Value::array(vec![Value::int(1), Value::int(2)]).to_string(), "[1, 2]");
        assert_eq!(Value::tuple(vec![Value::int(1), Value::int(2)]).to_string(), "(1, 2)");
    }

    #[test]
    fn array_is_reference_semantics_on_clone() {
        let a = Value::array(vec![Value::int(1)]);
        let b = a.clone();
        if let Value::Array(inner) = &b {
            inner.write().push(Value::int(2));
        }
        assert_eq!(a.to_string(), "[1, 2]");
    }

    #[test]
    fn deep_clone_is_independent() {
        let a = Value::array(vec![Value::int(1)]);
        let b = a.deep_clone().unwrap();
        if let Value::Array(inner) = &b {
            inner.write().push(Value::int(2));
        }
        assert_eq!(a.to_string(), "[1]");
        assert_eq!(b.to_string(), "[1, 2]");
    }

    #[test]
    fn channel_clone_is_an_error() {
        let chan = Value::new_channel(1);
        assert!(chan.deep_clone().is_err());
    }

    #[test]
    fn ref_deep_clone_copies_the_cell_not_the_aliasing() {
        let r = Value::new_ref(Value::int(1));
        let cloned = r.deep_clone().unwrap();
        if let Value::Ref(cell) = &r {
            *cell.write() = Value::int(2);
        }
        assert_eq!(r.to_string(), "<ref 2>");
        assert_eq!(cloned.to_string(), "<ref 1>");
    }

    #[test]
    fn struct_equality_is_field_wise_order_independent() {
        let a = Value::Struct(Arc::new(RwLock::new(StructObj {
            type_name: Arc::from("Point"),
            fields: vec![(Arc::from("x"), Value::int(1)), (Arc::from("y"), Value::int(2))],
        })));
        let b = Value::Struct(Arc::new(RwLock::new(StructObj {
            type_name: Arc::from("Point"),
            fields: vec![(Arc::from("y"), Value::int(2)), (Arc::from("x"), Value::int(1))],
        })));
        assert!(a.value_eq(&b));
    }

    #[test]
    fn set_rejects_unhashable_values() {
        let mut set = SetObj::default();
        assert!(set.insert(&Value::int(1)).unwrap());
        assert!(set.insert(&Value::array(vec![])).is_err());
    }
}
