//! # Ledger of cloud-object classes
//!
//! The Ledger is the source of truth for what a host can do with an object.
//! Every class is described once, up front, by a [`ClassBuilder`]: how to
//! construct it, which methods and fields are reachable remotely, and how it
//! behaves around migration. The builder erases all of that into a
//! [`ClassDef`] of type-erased invokers keyed by signature, so dispatch on the
//! hot path is a hash lookup plus a decode.
//!
//! ## Philosophy
//!
//! - **Signatures, not names**: methods are keyed by `name(param types)` and
//!   constructors by their parameter type list, so overloads coexist.
//! - **Composition as inheritance**: a class may embed a "superclass" struct and
//!   adopt its [`Lineage`] through a projection. Superclass levels run first in
//!   every migration step.
//! - **Cycles are cut before encoding**: transient and framework-managed fields
//!   are reset to their zero value before state is serialized, and rebuilt
//!   after it is decoded.
//!
//! ## Migration order
//!
//! Prepare: every pre-migration hook (root level first, ascending priority
//! within a level), then every transient reset, then the framework fields.
//!
//! Restore: every transient reinitialisation, then every post-migration hook
//! in the same level/priority order. Framework fields are injected afterwards
//! by the host.

use std::any::Any;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use cloudrpc::ClientId;
use cloudrpc::Codec;
use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::ObjectId;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::ObjectContext;

/// A live object as the host stores it.
pub type Instance = Box<dyn Any + Send>;

type Erased = dyn Any + Send;

type Action<T> = Arc<dyn Fn(&mut T) + Send + Sync>;
type Projection<U, T> = Arc<dyn Fn(&mut U) -> &mut T + Send + Sync>;
type Construct = Arc<dyn Fn(&[u8], Codec) -> Result<Instance, Fault> + Send + Sync>;
type Invoke = Arc<dyn Fn(&mut Erased, &[u8], Codec) -> Result<Vec<u8>, Fault> + Send + Sync>;
type Read = Arc<dyn Fn(&mut Erased, Codec) -> Result<Vec<u8>, Fault> + Send + Sync>;
type Write = Arc<dyn Fn(&mut Erased, &[u8], Codec) -> Result<(), Fault> + Send + Sync>;
type Step = Arc<dyn Fn(&mut Erased) -> Result<(), Fault> + Send + Sync>;
type Inject = Arc<dyn Fn(&mut Erased, ObjectId, &ObjectContext) -> Result<(), Fault> + Send + Sync>;
type EncodeState = Arc<dyn Fn(&Erased, Codec) -> Result<Vec<u8>, Fault> + Send + Sync>;

/// Argument lists that can cross the wire: `()` and tuples up to six values.
pub trait Args: Serialize + DeserializeOwned + Send + 'static {
    /// Parameter type names, in order. Part of every signature.
    fn type_names() -> Vec<String>;
}

impl Args for () {
    fn type_names() -> Vec<String> {
        Vec::new()
    }
}

macro_rules! impl_args {
    ($($name:ident),+) => {
        impl<$($name),+> Args for ($($name,)+)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static),+
        {
            fn type_names() -> Vec<String> {
                vec![$(type_name::<$name>().to_string()),+]
            }
        }
    };
}

impl_args!(A);
impl_args!(A, B);
impl_args!(A, B, C);
impl_args!(A, B, C, D);
impl_args!(A, B, C, D, E);
impl_args!(A, B, C, D, E, F);

/// `name(t1,t2)`.
pub fn signature(name: &str, param_types: &[String]) -> String {
    format!("{}({})", name, param_types.join(","))
}

fn downcast_mut<T: 'static>(instance: &mut Erased) -> Result<&mut T, Fault> {
    instance
        .downcast_mut::<T>()
        .ok_or_else(|| Fault::bad_arguments(format!("instance is not a {}", type_name::<T>())))
}

fn downcast_ref<T: 'static>(instance: &Erased) -> Result<&T, Fault> {
    instance
        .downcast_ref::<T>()
        .ok_or_else(|| Fault::bad_arguments(format!("instance is not a {}", type_name::<T>())))
}

pub(crate) fn decode<A: DeserializeOwned>(codec: Codec, bytes: &[u8], what: &str) -> Result<A, Fault> {
    codec
        .decode(bytes)
        .map_err(|e| Fault::bad_arguments(format!("{}: {}", what, e)))
}

pub(crate) fn encode<R: Serialize + ?Sized>(codec: Codec, value: &R) -> Result<Vec<u8>, Fault> {
    codec
        .encode(value)
        .map_err(|e| Fault::raised(format!("result encoding failed: {}", e)))
}

fn lift<U: 'static, T: 'static>(action: Action<T>, projection: &Projection<U, T>) -> Action<U> {
    let projection = projection.clone();
    Arc::new(move |outer: &mut U| action(projection(outer)))
}

struct Hook<T> {
    priority: i32,
    run: Action<T>,
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            run: self.run.clone(),
        }
    }
}

struct Transient<T> {
    reset: Action<T>,
    reinit: Action<T>,
}

/// Hooks and transient fields declared by one class in a hierarchy.
struct Level<T> {
    class: String,
    pre: Vec<Hook<T>>,
    post: Vec<Hook<T>>,
    transients: Vec<Transient<T>>,
}

impl<T: 'static> Level<T> {
    fn new(class: String) -> Self {
        Self {
            class,
            pre: Vec::new(),
            post: Vec::new(),
            transients: Vec::new(),
        }
    }

    fn project<U: 'static>(self, projection: &Projection<U, T>) -> Level<U> {
        let hooks = |hooks: Vec<Hook<T>>| -> Vec<Hook<U>> {
            hooks
                .into_iter()
                .map(|h| Hook {
                    priority: h.priority,
                    run: lift(h.run, projection),
                })
                .collect()
        };
        Level {
            class: self.class,
            pre: hooks(self.pre),
            post: hooks(self.post),
            transients: self
                .transients
                .into_iter()
                .map(|t| Transient {
                    reset: lift(t.reset, projection),
                    reinit: lift(t.reinit, projection),
                })
                .collect(),
        }
    }
}

/// Stable sort: equal priorities keep declaration order.
fn by_priority<T>(hooks: &[Hook<T>]) -> Vec<Action<T>> {
    let mut hooks = hooks.to_vec();
    hooks.sort_by_key(|h| h.priority);
    hooks.into_iter().map(|h| h.run).collect()
}

/// The migration-relevant part of a class hierarchy, root first.
///
/// Build one for a struct that other classes embed, then adopt it with
/// [`ClassBuilder::extends`] (or [`Lineage::extends`] for deeper chains).
pub struct Lineage<T> {
    ancestors: Vec<Level<T>>,
    own: Level<T>,
}

impl<T: 'static> Lineage<T> {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            ancestors: Vec::new(),
            own: Level::new(class.into()),
        }
    }

    pub fn pre_migration<H>(mut self, priority: i32, hook: H) -> Self
    where
        H: Fn(&mut T) + Send + Sync + 'static,
    {
        self.own.pre.push(Hook {
            priority,
            run: Arc::new(hook),
        });
        self
    }

    pub fn post_migration<H>(mut self, priority: i32, hook: H) -> Self
    where
        H: Fn(&mut T) + Send + Sync + 'static,
    {
        self.own.post.push(Hook {
            priority,
            run: Arc::new(hook),
        });
        self
    }

    /// Declares a field that does not travel with migrated state. It is reset
    /// to `V::default()` before encoding and set to `init()` after decoding.
    pub fn transient<V, P, I>(mut self, project: P, init: I) -> Self
    where
        V: Default + 'static,
        P: Fn(&mut T) -> &mut V + Send + Sync + 'static,
        I: Fn() -> V + Send + Sync + 'static,
    {
        let project: Projection<T, V> = Arc::new(project);
        let reset_project = project.clone();
        self.own.transients.push(Transient {
            reset: Arc::new(move |obj: &mut T| *reset_project(obj) = V::default()),
            reinit: Arc::new(move |obj: &mut T| *project(obj) = init()),
        });
        self
    }

    /// Places `parent`'s levels above this one. `project` reaches the embedded
    /// parent value.
    pub fn extends<B, P>(mut self, parent: Lineage<B>, project: P) -> Self
    where
        B: 'static,
        P: Fn(&mut T) -> &mut B + Send + Sync + 'static,
    {
        let projection: Projection<T, B> = Arc::new(project);
        let mut ancestors: Vec<Level<T>> = parent
            .into_levels()
            .map(|level| level.project(&projection))
            .collect();
        ancestors.append(&mut self.ancestors);
        self.ancestors = ancestors;
        self
    }

    /// Class names, root first.
    pub fn classes(&self) -> Vec<&str> {
        self.ancestors
            .iter()
            .chain(std::iter::once(&self.own))
            .map(|level| level.class.as_str())
            .collect()
    }

    fn into_levels(self) -> impl Iterator<Item = Level<T>> {
        self.ancestors.into_iter().chain(std::iter::once(self.own))
    }
}

struct FieldAccess {
    read: Read,
    write: Write,
}

struct StateCodec {
    encode: EncodeState,
    decode: Construct,
}

/// Fluent description of a cloud-object class.
pub struct ClassBuilder<T> {
    name: String,
    lineage: Lineage<T>,
    constructors: HashMap<Vec<String>, Construct>,
    methods: HashMap<String, Invoke>,
    fields: HashMap<String, FieldAccess>,
    object_id: Option<Projection<T, Option<ObjectId>>>,
    context: Option<Projection<T, Option<ObjectContext>>>,
    state: Option<StateCodec>,
}

impl<T: Send + 'static> ClassBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            lineage: Lineage::new(name.clone()),
            name,
            constructors: HashMap::new(),
            methods: HashMap::new(),
            fields: HashMap::new(),
            object_id: None,
            context: None,
            state: None,
        }
    }

    pub fn constructor<A, F>(self, f: F) -> Self
    where
        A: Args,
        F: Fn(A) -> T + Send + Sync + 'static,
    {
        self.try_constructor(move |args: A| Ok::<T, String>(f(args)))
    }

    /// A constructor that may raise. The error text becomes the fault message.
    pub fn try_constructor<A, E, F>(mut self, f: F) -> Self
    where
        A: Args,
        E: Display,
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        let construct: Construct = Arc::new(move |bytes: &[u8], codec: Codec| -> Result<Instance, Fault> {
            let args: A = decode(codec, bytes, "constructor arguments")?;
            let instance = f(args).map_err(|e| Fault::raised(e.to_string()))?;
            Ok(Box::new(instance) as Instance)
        });
        self.constructors.insert(A::type_names(), construct);
        self
    }

    pub fn method<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Serialize + 'static,
        F: Fn(&mut T, A) -> R + Send + Sync + 'static,
    {
        self.try_method(name, move |obj: &mut T, args: A| Ok::<R, String>(f(obj, args)))
    }

    /// A method that may raise. The error text becomes the fault message.
    pub fn try_method<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Serialize + 'static,
        E: Display,
        F: Fn(&mut T, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let invoke: Invoke = Arc::new(
            move |instance: &mut Erased, bytes: &[u8], codec: Codec| -> Result<Vec<u8>, Fault> {
                let obj = downcast_mut::<T>(instance)?;
                let args: A = decode(codec, bytes, "method arguments")?;
                let result = f(obj, args).map_err(|e| Fault::raised(e.to_string()))?;
                encode(codec, &result)
            },
        );
        self.methods.insert(signature(name, &A::type_names()), invoke);
        self
    }

    /// Exposes a field to remote get/set.
    pub fn field<V, P>(mut self, name: &str, project: P) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        P: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        let project: Projection<T, V> = Arc::new(project);
        let read_project = project.clone();
        let read: Read = Arc::new(move |instance: &mut Erased, codec: Codec| -> Result<Vec<u8>, Fault> {
            let obj = downcast_mut::<T>(instance)?;
            encode(codec, &*read_project(obj))
        });
        let write: Write = Arc::new(
            move |instance: &mut Erased, bytes: &[u8], codec: Codec| -> Result<(), Fault> {
                let obj = downcast_mut::<T>(instance)?;
                let value: V = decode(codec, bytes, "field value")?;
                *project(obj) = value;
                Ok(())
            },
        );
        self.fields.insert(name.to_string(), FieldAccess { read, write });
        self
    }

    /// Framework-managed: receives the object's id.
    pub fn object_id_field<P>(mut self, project: P) -> Self
    where
        P: Fn(&mut T) -> &mut Option<ObjectId> + Send + Sync + 'static,
    {
        self.object_id = Some(Arc::new(project));
        self
    }

    /// Framework-managed: receives the object's [`ObjectContext`].
    pub fn context_field<P>(mut self, project: P) -> Self
    where
        P: Fn(&mut T) -> &mut Option<ObjectContext> + Send + Sync + 'static,
    {
        self.context = Some(Arc::new(project));
        self
    }

    pub fn pre_migration<H>(mut self, priority: i32, hook: H) -> Self
    where
        H: Fn(&mut T) + Send + Sync + 'static,
    {
        self.lineage = self.lineage.pre_migration(priority, hook);
        self
    }

    pub fn post_migration<H>(mut self, priority: i32, hook: H) -> Self
    where
        H: Fn(&mut T) + Send + Sync + 'static,
    {
        self.lineage = self.lineage.post_migration(priority, hook);
        self
    }

    pub fn transient<V, P, I>(mut self, project: P, init: I) -> Self
    where
        V: Default + 'static,
        P: Fn(&mut T) -> &mut V + Send + Sync + 'static,
        I: Fn() -> V + Send + Sync + 'static,
    {
        self.lineage = self.lineage.transient(project, init);
        self
    }

    pub fn extends<B, P>(mut self, parent: Lineage<B>, project: P) -> Self
    where
        B: 'static,
        P: Fn(&mut T) -> &mut B + Send + Sync + 'static,
    {
        self.lineage = self.lineage.extends(parent, project);
        self
    }

    pub fn build(self) -> ClassDef {
        let levels: Vec<Level<T>> = self.lineage.into_levels().collect();
        let lineage = levels.iter().map(|level| level.class.clone()).collect();

        let pre: Vec<Action<T>> = levels.iter().flat_map(|level| by_priority(&level.pre)).collect();
        let post: Vec<Action<T>> = levels.iter().flat_map(|level| by_priority(&level.post)).collect();
        let resets: Vec<Action<T>> = levels
            .iter()
            .flat_map(|level| level.transients.iter().map(|t| t.reset.clone()))
            .collect();
        let reinits: Vec<Action<T>> = levels
            .iter()
            .flat_map(|level| level.transients.iter().map(|t| t.reinit.clone()))
            .collect();

        let clear_id = self.object_id.clone();
        let clear_context = self.context.clone();
        let prepare: Step = Arc::new(move |instance: &mut Erased| -> Result<(), Fault> {
            let obj = downcast_mut::<T>(instance)?;
            for hook in &pre {
                hook(&mut *obj);
            }
            for reset in &resets {
                reset(&mut *obj);
            }
            if let Some(project) = &clear_id {
                *project(&mut *obj) = None;
            }
            if let Some(project) = &clear_context {
                *project(&mut *obj) = None;
            }
            Ok(())
        });

        let restore: Step = Arc::new(move |instance: &mut Erased| -> Result<(), Fault> {
            let obj = downcast_mut::<T>(instance)?;
            for reinit in &reinits {
                reinit(&mut *obj);
            }
            for hook in &post {
                hook(&mut *obj);
            }
            Ok(())
        });

        let object_id = self.object_id;
        let context = self.context;
        let inject: Inject = Arc::new(
            move |instance: &mut Erased, id: ObjectId, ctx: &ObjectContext| -> Result<(), Fault> {
                let obj = downcast_mut::<T>(instance)?;
                if let Some(project) = &object_id {
                    *project(&mut *obj) = Some(id);
                }
                if let Some(project) = &context {
                    *project(&mut *obj) = Some(ctx.clone());
                }
                Ok(())
            },
        );

        ClassDef {
            name: self.name,
            lineage,
            constructors: self.constructors,
            methods: self.methods,
            fields: self.fields,
            prepare,
            restore,
            inject,
            state: self.state,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> ClassBuilder<T> {
    /// Allows instances to be serialized and moved between hosts.
    pub fn migratable(mut self) -> Self {
        let encode: EncodeState = Arc::new(|instance: &Erased, codec: Codec| -> Result<Vec<u8>, Fault> {
            let obj = downcast_ref::<T>(instance)?;
            codec
                .encode(obj)
                .map_err(|e| Fault::new(FaultKind::Migration, format!("state encoding failed: {}", e)))
        });
        let decode: Construct = Arc::new(|bytes: &[u8], codec: Codec| -> Result<Instance, Fault> {
            let obj: T = codec
                .decode(bytes)
                .map_err(|e| Fault::new(FaultKind::Migration, format!("state decoding failed: {}", e)))?;
            Ok(Box::new(obj) as Instance)
        });
        self.state = Some(StateCodec { encode, decode });
        self
    }
}

/// A type-erased class: everything a host needs to run instances of it.
pub struct ClassDef {
    name: String,
    lineage: Vec<String>,
    constructors: HashMap<Vec<String>, Construct>,
    methods: HashMap<String, Invoke>,
    fields: HashMap<String, FieldAccess>,
    prepare: Step,
    restore: Step,
    inject: Inject,
    state: Option<StateCodec>,
}

impl ClassDef {
    pub fn builder<T: Send + 'static>(name: impl Into<String>) -> ClassBuilder<T> {
        ClassBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class names from the root of the hierarchy down to this class.
    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    pub fn is_migratable(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_method(&self, name: &str, param_types: &[String]) -> bool {
        self.methods.contains_key(&signature(name, param_types))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn construct(&self, param_types: &[String], args: &[u8], codec: Codec) -> Result<Instance, Fault> {
        let construct = self.constructors.get(param_types).ok_or_else(|| {
            Fault::new(
                FaultKind::NoSuchConstructor,
                format!("{}({})", self.name, param_types.join(",")),
            )
        })?;
        construct(args, codec)
    }

    pub fn invoke(
        &self,
        instance: &mut Erased,
        method: &str,
        param_types: &[String],
        args: &[u8],
        codec: Codec,
    ) -> Result<Vec<u8>, Fault> {
        let key = signature(method, param_types);
        let invoke = self
            .methods
            .get(&key)
            .ok_or_else(|| Fault::new(FaultKind::NoSuchMethod, format!("{}::{}", self.name, key)))?;
        invoke(instance, args, codec)
    }

    pub fn read_field(&self, instance: &mut Erased, field: &str, codec: Codec) -> Result<Vec<u8>, Fault> {
        (self.field(field)?.read)(instance, codec)
    }

    pub fn write_field(&self, instance: &mut Erased, field: &str, value: &[u8], codec: Codec) -> Result<(), Fault> {
        (self.field(field)?.write)(instance, value, codec)
    }

    fn field(&self, field: &str) -> Result<&FieldAccess, Fault> {
        self.fields
            .get(field)
            .ok_or_else(|| Fault::new(FaultKind::NoSuchField, format!("{}.{}", self.name, field)))
    }

    /// Runs pre-migration hooks, then clears transient and framework fields.
    pub fn prepare_for_migration(&self, instance: &mut Erased) -> Result<(), Fault> {
        (self.prepare)(instance)
    }

    /// Reinitialises transient fields, then runs post-migration hooks.
    pub fn restore_after_migration(&self, instance: &mut Erased) -> Result<(), Fault> {
        (self.restore)(instance)
    }

    pub fn inject(&self, instance: &mut Erased, id: ObjectId, context: &ObjectContext) -> Result<(), Fault> {
        (self.inject)(instance, id, context)
    }

    pub fn encode_state(&self, instance: &Erased, codec: Codec) -> Result<Vec<u8>, Fault> {
        match &self.state {
            Some(state) => (state.encode)(instance, codec),
            None => Err(self.not_migratable()),
        }
    }

    pub fn decode_state(&self, bytes: &[u8], codec: Codec) -> Result<Instance, Fault> {
        match &self.state {
            Some(state) => (state.decode)(bytes, codec),
            None => Err(self.not_migratable()),
        }
    }

    fn not_migratable(&self) -> Fault {
        Fault::new(FaultKind::NotMigratable, format!("class `{}` is not migratable", self.name))
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("lineage", &self.lineage)
            .field("methods", &methods)
            .field("migratable", &self.is_migratable())
            .finish_non_exhaustive()
    }
}

/// Resolves class definitions for a host. Hosts cache the result per client.
pub trait ClassProvider: Send + Sync + 'static {
    fn fetch(&self, client: &ClientId, name: &str) -> anyhow::Result<Arc<ClassDef>>;
}

/// In-process class provider.
///
/// Definitions registered for a specific client shadow shared ones, so two
/// clients may ship different classes under the same name.
#[derive(Default)]
pub struct Catalog {
    shared: DashMap<String, Arc<ClassDef>>,
    scoped: DashMap<(ClientId, String), Arc<ClassDef>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: ClassDef) -> &Self {
        self.shared.insert(class.name().to_string(), Arc::new(class));
        self
    }

    pub fn register_for(&self, client: ClientId, class: ClassDef) -> &Self {
        self.scoped.insert((client, class.name().to_string()), Arc::new(class));
        self
    }

    pub fn len(&self) -> usize {
        self.shared.len() + self.scoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassProvider for Catalog {
    fn fetch(&self, client: &ClientId, name: &str) -> anyhow::Result<Arc<ClassDef>> {
        if let Some(class) = self.scoped.get(&(*client, name.to_string())) {
            return Ok(class.clone());
        }
        match self.shared.get(name) {
            Some(class) => Ok(class.clone()),
            None => anyhow::bail!("class `{}` is not known", name),
        }
    }
}
