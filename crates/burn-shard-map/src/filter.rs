//! Shard maps over arbitrary argument trees.
//!
//! [`shard_map`](crate::shard_map()) only moves arrays. [`FilterShardMap`] lets any mix of
//! arrays and static values cross it: static arguments are captured on the way in, static
//! outputs travel back as one [`StaticBox`] under a replicated spec, and both are merged with
//! the array halves again on the far side.
//!
//! Static output must be the same on every instance. It is not compared; the first
//! instance's copy is returned.

use alloc::borrow::Cow;
use alloc::sync::Arc;
use core::fmt;

use derive_new::new;
use log::debug;

use crate::Error;
use crate::collective::ShardContext;
use crate::shard_map::{ShardMapConfig, shard_map};
use crate::sharding::SpecTree;
use crate::tree::{StaticBox, Tree, combine, is_array, partition};

/// Positional and keyword arguments of a dynamic call.
///
/// Only [`FilterShardMap::invoke`] takes this form, so that keyword arguments can be
/// rejected; [`FilterShardMap::call`] takes positional arguments directly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments {
    positional: Vec<Tree>,
    keyword: Vec<(String, Tree)>,
}

impl Arguments {
    /// An empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg<T: Into<Tree>>(mut self, value: T) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Appends a keyword argument.
    pub fn kwarg<S: Into<String>, T: Into<Tree>>(mut self, name: S, value: T) -> Self {
        self.keyword.push((name.into(), value.into()));
        self
    }

    /// The positional arguments, or [`Error::KeywordArguments`] if any keyword was given.
    pub fn into_positional(self) -> Result<Vec<Tree>, Error> {
        if !self.keyword.is_empty() {
            return Err(Error::KeywordArguments {
                names: self.keyword.into_iter().map(|(name, _)| name).collect(),
            });
        }
        Ok(self.positional)
    }
}

impl From<Vec<Tree>> for Arguments {
    fn from(positional: Vec<Tree>) -> Self {
        Self {
            positional,
            keyword: Vec::new(),
        }
    }
}

/// Name and documentation of a wrapped function, for introspection only.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct FunctionIdentity {
    name: Cow<'static, str>,
    doc: Option<Cow<'static, str>>,
}

impl FunctionIdentity {
    /// The identity of `F`, named after its type.
    pub fn of<F>() -> Self {
        Self::new(Cow::Borrowed(core::any::type_name::<F>()), None)
    }

    /// Replaces the name.
    pub fn with_name<S: Into<Cow<'static, str>>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Attaches a doc string.
    pub fn with_doc<S: Into<Cow<'static, str>>>(mut self, doc: S) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// The function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The doc string, if one was attached.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }
}

struct Wrapped<F> {
    fun: F,
    identity: FunctionIdentity,
    config: ShardMapConfig,
}

/// A function wrapped by [`filter_shard_map`].
///
/// The wrapper is immutable; clones share the same function and configuration.
pub struct FilterShardMap<F> {
    inner: Arc<Wrapped<F>>,
}

impl<F> Clone for FilterShardMap<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F> fmt::Debug for FilterShardMap<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterShardMap")
            .field("identity", &self.inner.identity)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Wraps `fun` so it can be called with arbitrary argument trees.
pub fn filter_shard_map<F>(fun: F, config: ShardMapConfig) -> FilterShardMap<F>
where
    F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Send + Sync,
{
    FilterShardMap::new(fun, config)
}

/// Captures a configuration to wrap functions with later.
pub fn configure(config: ShardMapConfig) -> FilterShardMapFactory {
    FilterShardMapFactory { config }
}

/// A reusable [`filter_shard_map`] with its configuration already chosen.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterShardMapFactory {
    config: ShardMapConfig,
}

impl FilterShardMapFactory {
    /// The configuration every wrapped function receives.
    pub fn config(&self) -> &ShardMapConfig {
        &self.config
    }

    /// Wraps `fun` with this factory's configuration.
    pub fn wrap<F>(&self, fun: F) -> FilterShardMap<F>
    where
        F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Send + Sync,
    {
        FilterShardMap::new(fun, self.config.clone())
    }
}

impl<F> FilterShardMap<F>
where
    F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Send + Sync,
{
    /// Wraps `fun`, named after its type.
    pub fn new(fun: F, config: ShardMapConfig) -> Self {
        Self::with_identity(fun, FunctionIdentity::of::<F>(), config)
    }

    /// Wraps `fun` under an explicit identity.
    pub fn with_identity(fun: F, identity: FunctionIdentity, config: ShardMapConfig) -> Self {
        Self {
            inner: Arc::new(Wrapped {
                fun,
                identity,
                config,
            }),
        }
    }

    /// Calls the wrapped function with positional arguments.
    pub fn call(&self, args: Vec<Tree>) -> Result<Tree, Error> {
        let (dynamic_args, static_args) = partition(Tree::Tuple(args), is_array);

        let inner = |ctx: &ShardContext<'_>, args: Vec<Tree>| -> Result<Tree, Error> {
            let [dynamic_args] = exactly::<1>(args, "one argument tuple")?;
            let args = match combine(dynamic_args, static_args.clone())? {
                Tree::Tuple(args) => args,
                other => vec![other],
            };
            let output = (self.inner.fun)(ctx, args)?;
            let (dynamic_out, static_out) = partition(output, is_array);
            let static_out = Tree::Boxed(StaticBox::new(static_out));
            Ok(Tree::Tuple(vec![dynamic_out, static_out]))
        };

        let config = &self.inner.config;
        let config = config.with_specs(
            SpecTree::Tuple(vec![config.in_specs().clone()]),
            SpecTree::Tuple(vec![config.out_specs().clone(), SpecTree::replicated()]),
        );
        debug!("filter_shard_map: calling {}", self.inner.identity.name());

        let output = shard_map(inner, config).call(vec![dynamic_args])?;
        let [dynamic_out, static_out] = match output {
            Tree::Tuple(items) => exactly::<2>(items, "output pair")?,
            other => return Err(unexpected("output pair", &other)),
        };
        let static_out = match static_out {
            Tree::Boxed(boxed) => boxed.into_value(),
            other => return Err(unexpected("boxed static value", &other)),
        };

        combine(dynamic_out, static_out)
    }

    /// Calls the wrapped function, rejecting keyword arguments before anything else runs.
    pub fn invoke(&self, args: Arguments) -> Result<Tree, Error> {
        self.call(args.into_positional()?)
    }

    /// Binds `owner` as the first argument of every call.
    pub fn bind_to<T: Into<Tree>>(&self, owner: T) -> BoundFilterShardMap<F> {
        BoundFilterShardMap {
            wrapper: self.clone(),
            owner: owner.into(),
        }
    }
}

impl<F> FilterShardMap<F> {
    /// Name and documentation of the wrapped function.
    pub fn identity(&self) -> &FunctionIdentity {
        &self.inner.identity
    }

    /// Name of the wrapped function.
    pub fn name(&self) -> &str {
        self.inner.identity.name()
    }

    /// Doc string of the wrapped function.
    pub fn doc(&self) -> Option<&str> {
        self.inner.identity.doc()
    }

    /// The wrapped function.
    pub fn wrapped(&self) -> &F {
        &self.inner.fun
    }

    /// The configuration given at wrapping time.
    pub fn config(&self) -> &ShardMapConfig {
        &self.inner.config
    }

    /// Whether both wrappers are the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn exactly<const N: usize>(items: Vec<Tree>, expected: &str) -> Result<[Tree; N], Error> {
    <[Tree; N]>::try_from(items).map_err(|items| Error::UnexpectedTree {
        expected: expected.to_string(),
        found: format!("{} items", items.len()),
    })
}

fn unexpected(expected: &str, found: &Tree) -> Error {
    Error::UnexpectedTree {
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

/// A [`FilterShardMap`] with its first argument fixed.
///
/// Binding shares the wrapper; it never copies the function or configuration.
pub struct BoundFilterShardMap<F> {
    wrapper: FilterShardMap<F>,
    owner: Tree,
}

impl<F> Clone for BoundFilterShardMap<F> {
    fn clone(&self) -> Self {
        Self {
            wrapper: self.wrapper.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<F> fmt::Debug for BoundFilterShardMap<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFilterShardMap")
            .field("wrapper", &self.wrapper)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<F> BoundFilterShardMap<F>
where
    F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Send + Sync,
{
    /// Calls the wrapped function with the owner prepended.
    pub fn call(&self, args: Vec<Tree>) -> Result<Tree, Error> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.owner.clone());
        full.extend(args);
        self.wrapper.call(full)
    }

    /// As [`call`](Self::call), rejecting keyword arguments first.
    pub fn invoke(&self, args: Arguments) -> Result<Tree, Error> {
        self.call(args.into_positional()?)
    }
}

impl<F> BoundFilterShardMap<F> {
    /// The bound first argument.
    pub fn owner(&self) -> &Tree {
        &self.owner
    }

    /// The shared wrapper.
    pub fn wrapper(&self) -> &FilterShardMap<F> {
        &self.wrapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceMesh, PartitionSpec};
    use ndarray::Array;

    fn config() -> ShardMapConfig {
        let batch = PartitionSpec::sharded("batch");
        ShardMapConfig::new(batch.clone(), batch)
            .with_mesh(DeviceMesh::make([2], ["batch"]).unwrap())
    }

    fn first(_: &ShardContext<'_>, mut args: Vec<Tree>) -> Result<Tree, Error> {
        Ok(args.remove(0))
    }

    #[test]
    fn identity_defaults_to_the_function_type() {
        let wrapped = filter_shard_map(first, config());

        assert!(wrapped.name().ends_with("first"));
        assert_eq!(wrapped.doc(), None);

        let identity = FunctionIdentity::of::<()>()
            .with_name("head")
            .with_doc("Returns the first argument.");
        let renamed = FilterShardMap::with_identity(first, identity, config());
        assert_eq!(renamed.name(), "head");
        assert_eq!(renamed.doc(), Some("Returns the first argument."));
    }

    #[test]
    fn keyword_arguments_are_named_in_the_error() {
        let args = Arguments::new()
            .arg("x")
            .kwarg("scale", 2.0)
            .kwarg("bias", 1.0);

        assert_eq!(
            args.into_positional(),
            Err(Error::KeywordArguments {
                names: vec!["scale".to_string(), "bias".to_string()]
            })
        );
    }

    #[test]
    fn static_only_calls_pass_through() {
        let wrapped = filter_shard_map(first, config());

        let output = wrapped.call(vec![Tree::from("static")]);

        assert_eq!(output, Ok(Tree::from("static")));
    }

    #[test]
    fn clones_share_the_wrapper() {
        let wrapped = filter_shard_map(first, config());
        let bound = wrapped.bind_to(Tree::Array(Array::zeros(2).into_dyn()));

        assert!(wrapped.clone().ptr_eq(&wrapped));
        assert!(bound.wrapper().ptr_eq(&wrapped));
        assert_eq!(bound.owner().kind(), "array");
    }
}
