//! 容器定律：resize / insert / erase 与计数的关系

use proptest::prelude::*;
use std::sync::Arc;
use struct_bridge::access::{AccessContext, ObjectRef, Value};
use struct_bridge::core::{BridgeError, ContainerError, Runtime};
use struct_bridge::fields::container::{count, erase, insert, read_item, resize};
use struct_bridge::fields::CountMode;
use struct_bridge::types::{lifecycle, ContainerIdentity, PrimitiveKind, TypeId, TypeRegistry};

struct Fixture {
    runtime: Arc<Runtime>,
    vector: TypeId,
    read_only: TypeId,
}

fn fixture() -> Fixture {
    let mut b = TypeRegistry::builder();
    let i32_t = b.primitive(PrimitiveKind::I32);
    let vector = b.container(ContainerIdentity::vector(i32_t));
    let read_only = b.container(ContainerIdentity::vector(i32_t).read_only());
    Fixture {
        runtime: Runtime::builder()
            .types(b.build().expect("valid schema"))
            .build()
            .expect("runtime"),
        vector,
        read_only,
    }
}

fn new_obj(ctx: &mut AccessContext<'_>, ty: TypeId) -> ObjectRef {
    ObjectRef::new(lifecycle::allocate(ctx.types, ctx.mem, ty).unwrap(), ty)
}

fn items(ctx: &mut AccessContext<'_>, obj: ObjectRef) -> Vec<i64> {
    let n = count(ctx, obj, CountMode::Len).unwrap();
    (0..n)
        .map(|i| read_item(ctx, obj, i).unwrap().as_int().unwrap())
        .collect()
}

fn fill(ctx: &mut AccessContext<'_>, obj: ObjectRef, values: &[i32]) {
    for v in values {
        insert(ctx, obj, None, &Value::Int(*v as i64)).unwrap();
    }
}

proptest! {
    #[test]
    fn resize_sets_len(initial in prop::collection::vec(any::<i32>(), 0..16), n in 0usize..32) {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.vector);
            fill(ctx, v, &initial);
            resize(ctx, v, n).unwrap();
            prop_assert_eq!(count(ctx, v, CountMode::Len).unwrap(), n);
            // 保留的前缀不变，新增的元素为零
            let after = items(ctx, v);
            for (i, item) in after.iter().enumerate() {
                let expected = initial.get(i).map(|x| *x as i64).unwrap_or(0);
                prop_assert_eq!(*item, expected);
            }
            Ok(())
        })?;
    }

    #[test]
    fn insert_grows_by_one(
        initial in prop::collection::vec(any::<i32>(), 0..16),
        seed in any::<usize>(),
        value in any::<i32>(),
    ) {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.vector);
            fill(ctx, v, &initial);
            let index = seed % (initial.len() + 1);
            insert(ctx, v, Some(index), &Value::Int(value as i64)).unwrap();
            prop_assert_eq!(count(ctx, v, CountMode::Len).unwrap(), initial.len() + 1);
            prop_assert_eq!(read_item(ctx, v, index).unwrap(), Value::Int(value as i64));

            let mut expected: Vec<i64> = initial.iter().map(|x| *x as i64).collect();
            expected.insert(index, value as i64);
            prop_assert_eq!(items(ctx, v), expected);
            Ok(())
        })?;
    }

    #[test]
    fn erase_shrinks_by_one_and_shifts(
        initial in prop::collection::vec(any::<i32>(), 1..16),
        seed in any::<usize>(),
    ) {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.vector);
            fill(ctx, v, &initial);
            let index = seed % initial.len();
            erase(ctx, v, index).unwrap();
            prop_assert_eq!(count(ctx, v, CountMode::Len).unwrap(), initial.len() - 1);

            let mut expected: Vec<i64> = initial.iter().map(|x| *x as i64).collect();
            expected.remove(index);
            prop_assert_eq!(items(ctx, v), expected);
            Ok(())
        })?;
    }

    #[test]
    fn read_only_rejects_every_mutation(n in 0usize..8, value in any::<i32>()) {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.read_only);
            let before = ctx.mem.read_bytes(v.address, 24).unwrap();
            for result in [
                resize(ctx, v, n),
                insert(ctx, v, None, &Value::Int(value as i64)),
                erase(ctx, v, 0),
            ] {
                prop_assert!(matches!(
                    result,
                    Err(BridgeError::Container(ContainerError::ReadOnly(_)))
                ));
            }
            prop_assert_eq!(ctx.mem.read_bytes(v.address, 24).unwrap(), before);
            prop_assert_eq!(count(ctx, v, CountMode::Len).unwrap(), 0);
            Ok(())
        })?;
    }
}

#[test]
fn test_erase_out_of_bounds_does_not_mutate() {
    let f = fixture();
    f.runtime.with_access(|ctx| {
        let v = new_obj(ctx, f.vector);
        fill(ctx, v, &[1, 2, 3]);
        assert!(matches!(
            erase(ctx, v, 3),
            Err(BridgeError::Container(ContainerError::OutOfBounds { .. }))
        ));
        assert_eq!(items(ctx, v), vec![1, 2, 3]);
    });
}
