use std::sync::Arc;

use burn_shard_map::sharding::{DeviceMesh, DimDistribution, PartitionSpec, SpecTree, with_mesh};
use burn_shard_map::tree::{Opaque, Record, StaticValue, Tree};
use burn_shard_map::{
    Arguments, Error, ShardContext, ShardMapConfig, Tensor, configure, filter_shard_map, shard_map,
};
use ndarray::{Array, arr0};
use pretty_assertions::assert_eq;
use rstest::rstest;

const N: usize = 4;

fn mesh() -> DeviceMesh {
    DeviceMesh::make([N], ["batch"]).unwrap()
}

fn sharded() -> PartitionSpec {
    PartitionSpec::sharded("batch")
}

fn replicated() -> PartitionSpec {
    PartitionSpec::replicated()
}

fn range(len: usize) -> Tensor {
    Array::range(0.0f32, len as f32, 1.0).into_dyn()
}

fn ones(len: usize) -> Tensor {
    Tensor::ones(vec![len])
}

fn array(tree: &Tree) -> Result<&Tensor, Error> {
    tree.as_array().ok_or_else(|| Error::UnexpectedTree {
        expected: "array".to_string(),
        found: tree.kind().to_string(),
    })
}

fn scale(_: &ShardContext<'_>, args: Vec<Tree>) -> Result<Tree, Error> {
    let (w, x) = (array(&args[0])?, array(&args[1])?);
    Ok(Tree::Array(x * w))
}

fn add_one_with_metadata(_: &ShardContext<'_>, args: Vec<Tree>) -> Result<Tree, Error> {
    let x = array(&args[0])?;
    Ok(Tree::tuple([Tree::Array(x + 1.0), Tree::from("metadata")]))
}

fn global_sum(ctx: &ShardContext<'_>, args: Vec<Tree>) -> Result<Tree, Error> {
    let local = arr0(array(&args[0])?.sum()).into_dyn();
    ctx.psum(&local, &["batch"]).map(Tree::Array)
}

#[test]
fn scales_a_sharded_batch() {
    let config = ShardMapConfig::new([replicated(), sharded()], sharded())
        .with_mesh(mesh());
    let wrapped = filter_shard_map(scale, config);
    let w = Tree::Array(arr0(2.0f32).into_dyn());

    let output = wrapped.call(vec![w, Tree::Array(range(4 * N))]).unwrap();

    assert_eq!(output, Tree::Array(range(4 * N) * 2.0));
}

#[test]
fn static_scalar_arguments_stay_on_the_host() {
    let config = ShardMapConfig::new([replicated(), sharded()], sharded())
        .with_mesh(mesh());
    let wrapped = filter_shard_map(
        |_: &ShardContext<'_>, args: Vec<Tree>| {
            let w = args[0].clone().into_typed::<f64>()? as f32;
            Ok(Tree::Array(array(&args[1])? * w))
        },
        config,
    );
    let args = vec![Tree::from(2.0), Tree::Array(range(4 * N))];

    let output = wrapped.call(args).unwrap();

    assert_eq!(output, Tree::Array(range(4 * N) * 2.0));
}

#[test]
fn static_output_survives() {
    let out_specs = SpecTree::tuple([sharded(), replicated()]);
    let config = ShardMapConfig::new(sharded(), out_specs).with_mesh(mesh());
    let wrapped = filter_shard_map(add_one_with_metadata, config);

    let output = wrapped.call(vec![Tree::Array(ones(2 * N))]).unwrap();

    assert_eq!(
        output,
        Tree::tuple([Tree::Array(ones(2 * N) + 1.0), Tree::from("metadata")])
    );
}

#[test]
fn collective_sum_over_the_batch() {
    let config = ShardMapConfig::new(sharded(), replicated())
        .with_mesh(mesh());
    let wrapped = filter_shard_map(global_sum, config);

    let output = wrapped.call(vec![Tree::Array(ones(4 * N))]).unwrap();

    assert_eq!(output, Tree::Array(arr0((4 * N) as f32).into_dyn()));
}

#[test]
fn array_only_calls_match_the_primitive() {
    let config = ShardMapConfig::new([replicated(), sharded()], sharded())
        .with_mesh(mesh());
    let w = Tree::Array(arr0(3.0f32).into_dyn());
    let args = vec![w, Tree::Array(range(2 * N))];

    let filtered = filter_shard_map(scale, config.clone()).call(args.clone());
    let direct = shard_map(scale, config).call(args);

    assert_eq!(filtered, direct);
}

#[test]
fn records_keep_their_static_fields() {
    type Activation = Arc<dyn Fn(f32) -> f32 + Send + Sync>;
    let relu: Activation = Arc::new(|x: f32| x.max(0.0));
    let activation = Opaque::new(relu);
    let layer: Tree = Record::new("Dense")
        .with_field("weight", Tree::Array(ones(2)))
        .with_field("name", "dense_1")
        .with_field("activation", StaticValue::Opaque(activation.clone()))
        .into();
    let config = ShardMapConfig::new(
        [replicated(), sharded()],
        SpecTree::tuple([replicated(), sharded()]),
    )
    .with_mesh(mesh());
    let wrapped = filter_shard_map(
        |_: &ShardContext<'_>, args: Vec<Tree>| {
            let layer = args[0].clone();
            let x = array(&args[1])?.mapv(|v| v - 2.0);
            Ok(Tree::tuple([layer, Tree::Array(x)]))
        },
        config,
    );

    let output = wrapped
        .call(vec![layer.clone(), Tree::Array(range(N))])
        .unwrap();
    let items = output.as_tuple().unwrap();

    assert_eq!(items[0], layer);
    match items[0].field("activation").and_then(Tree::as_static) {
        Some(StaticValue::Opaque(restored)) => {
            assert!(restored.ptr_eq(&activation));
            let relu = restored.downcast_ref::<Activation>().unwrap();
            assert_eq!((**relu)(-1.0), 0.0);
        }
        other => panic!("activation lost: {other:?}"),
    }
    assert_eq!(items[1], Tree::Array(range(N) - 2.0));
}

#[rstest]
#[case::no_positional(Arguments::new())]
#[case::one_positional(Arguments::new().arg(Tree::Array(ones(N))))]
#[case::many_positional(Arguments::new().arg(Tree::Array(ones(N))).arg("a").arg(1i64))]
fn keyword_arguments_are_rejected(#[case] args: Arguments) {
    let config = ShardMapConfig::new(sharded(), sharded());
    let wrapped = filter_shard_map(
        |_: &ShardContext<'_>, _: Vec<Tree>| -> Result<Tree, Error> {
            panic!("the wrapped function must not run")
        },
        config,
    );

    // No mesh is configured: the keyword check must fail before the mesh is looked up.
    let result = wrapped.invoke(args.kwarg("scale", 2.0));

    assert_eq!(
        result,
        Err(Error::KeywordArguments {
            names: vec!["scale".to_string()]
        })
    );
}

#[test]
fn bound_owners_do_not_interfere() {
    let config = ShardMapConfig::new([replicated(), sharded()], sharded())
        .with_mesh(mesh());
    let wrapped = filter_shard_map(scale, config);
    let x = || vec![Tree::Array(range(N))];

    let double = wrapped.bind_to(Tree::Array(arr0(2.0f32).into_dyn()));
    let triple = wrapped.bind_to(Tree::Array(arr0(3.0f32).into_dyn()));

    assert_eq!(double.call(x()), Ok(Tree::Array(range(N) * 2.0)));
    assert_eq!(triple.call(x()), Ok(Tree::Array(range(N) * 3.0)));
    assert_eq!(double.call(x()), Ok(Tree::Array(range(N) * 2.0)));
    assert!(double.wrapper().ptr_eq(triple.wrapper()));

    let with_keyword = Arguments::from(x()).kwarg("x", 1i64);
    assert_eq!(
        double.invoke(with_keyword),
        Err(Error::KeywordArguments {
            names: vec!["x".to_string()]
        })
    );
}

#[test]
fn factory_wraps_many_functions() {
    let config = ShardMapConfig::new(sharded(), replicated())
        .with_mesh(mesh());
    let factory = configure(config);

    let sum = factory.wrap(global_sum);
    let count = factory.wrap(|ctx: &ShardContext<'_>, _: Vec<Tree>| {
        Ok(Tree::Array(arr0(ctx.axis_size("batch")? as f32).into_dyn()))
    });

    assert_eq!(
        sum.call(vec![Tree::Array(ones(N))]),
        Ok(Tree::Array(arr0(N as f32).into_dyn()))
    );
    assert_eq!(
        count.call(vec![Tree::Array(ones(N))]),
        Ok(Tree::Array(arr0(N as f32).into_dyn()))
    );
    assert_eq!(sum.config(), factory.config());
}

#[test]
fn ambient_mesh_is_used_when_none_is_configured() {
    let config = ShardMapConfig::new(sharded(), replicated());
    let wrapped = filter_shard_map(global_sum, config);

    let x = || vec![Tree::Array(ones(N))];

    assert_eq!(wrapped.call(x()), Err(Error::MissingMesh));
    assert_eq!(
        with_mesh(mesh(), || wrapped.call(x())),
        Ok(Tree::Array(arr0(N as f32).into_dyn()))
    );
}

#[test]
fn primitive_errors_propagate_unchanged() {
    let call = |in_specs: SpecTree, out_specs: PartitionSpec| {
        let config = ShardMapConfig::new(in_specs, out_specs).with_mesh(mesh());
        let w = Tree::Array(arr0(2.0f32).into_dyn());
        filter_shard_map(scale, config).call(vec![w, Tree::Array(range(N + 1))])
    };

    assert_eq!(
        call(SpecTree::tuple([replicated(), sharded()]), sharded()),
        Err(Error::IndivisibleDimension {
            path: "[0][1]".to_string(),
            dimension: 0,
            size: N + 1,
            partitions: N
        })
    );
    assert_eq!(
        call(PartitionSpec::sharded("model").into(), replicated()),
        Err(Error::UnknownMeshAxis {
            axis_name: "model".to_string()
        })
    );

    let wrong_arity = call(SpecTree::tuple([replicated()]), sharded());
    assert!(matches!(wrong_arity, Err(Error::SpecStructureMismatch { .. })));
}

#[test]
fn replicated_outputs_are_checked_unless_disabled() {
    let config = ShardMapConfig::new(sharded(), replicated())
        .with_mesh(mesh());
    let local_sum = |_: &ShardContext<'_>, args: Vec<Tree>| -> Result<Tree, Error> {
        Ok(Tree::Array(arr0(array(&args[0])?.sum()).into_dyn()))
    };
    let x = || vec![Tree::Array(range(N))];

    assert_eq!(
        filter_shard_map(local_sum, config.clone()).call(x()),
        Err(Error::ReplicationCheckFailed {
            path: "[0]".to_string(),
            axis_name: "batch".to_string()
        })
    );
    assert_eq!(
        filter_shard_map(local_sum, config.with_check_vma(false)).call(x()),
        Ok(Tree::Array(arr0(0.0f32).into_dyn()))
    );
}

#[test]
fn two_dimensional_meshes_shard_over_both_axes() {
    let mesh = DeviceMesh::make([2, 2], ["data", "model"]).unwrap();
    let spec = PartitionSpec::new(vec![
        DimDistribution::sharded("data"),
        DimDistribution::sharded("model"),
    ]);
    let config = ShardMapConfig::new(spec.clone(), spec).with_mesh(mesh);
    let wrapped = filter_shard_map(
        |ctx: &ShardContext<'_>, args: Vec<Tree>| {
            let offset = (ctx.axis_index("data")? * 10 + ctx.axis_index("model")?) as f32;
            Ok(Tree::Array(array(&args[0])? + offset))
        },
        config,
    );

    let output = wrapped
        .call(vec![Tree::Array(Tensor::zeros(vec![2, 2]))])
        .unwrap();

    assert_eq!(
        output,
        Tree::Array(ndarray::arr2(&[[0.0f32, 1.0], [10.0, 11.0]]).into_dyn())
    );
}
