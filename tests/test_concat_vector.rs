use std::io::Cursor;

use loglinear::ConcatVector;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Part {
    Dense(Vec<f64>),
    Sparse(usize, f64),
}

fn part() -> impl Strategy<Value = Part> {
    prop_oneof![
        prop::collection::vec(-10.0f64..10.0, 0..6).prop_map(Part::Dense),
        (0usize..8, -10.0f64..10.0).prop_map(|(i, v)| Part::Sparse(i, v)),
    ]
}

fn vector() -> impl Strategy<Value = ConcatVector> {
    prop::collection::vec(part(), 0..5).prop_map(|parts| {
        let mut v = ConcatVector::new(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            match part {
                Part::Dense(values) => v.set_dense_component(i, values),
                Part::Sparse(index, value) => v.set_sparse_component(i, index, value),
            }
        }
        v
    })
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-4 * (1.0 + a.abs().max(b.abs()))
}

proptest! {
    #[test]
    fn dot_product_is_commutative(a in vector(), b in vector()) {
        prop_assert!(close(a.dot_product(&b), b.dot_product(&a)));
    }

    #[test]
    fn deep_clone_preserves_dot_product(a in vector(), b in vector()) {
        prop_assert!(close(a.deep_clone().dot_product(&b), a.dot_product(&b)));
        prop_assert!(a.deep_clone().value_equals(&a, 0.0));
    }

    #[test]
    fn add_is_linear(a in vector(), b in vector(), c in vector(), scale in -3.0f64..3.0) {
        let expected = a.dot_product(&c) + scale * b.dot_product(&c);
        let mut sum = a.deep_clone();
        sum.add_vector_in_place(&b, scale);
        prop_assert!(close(sum.dot_product(&c), expected));
    }

    #[test]
    fn serialization_preserves_dot_product(a in vector(), probe in vector()) {
        let mut buf = Vec::new();
        a.write_to(&mut buf).unwrap();
        let read = ConcatVector::read_from(&mut Cursor::new(buf)).unwrap();
        prop_assert!(read.value_equals(&a, 1e-5));
        prop_assert!(close(read.dot_product(&probe), a.dot_product(&probe)));
    }

    #[test]
    fn elementwise_product_matches_values(a in vector(), b in vector()) {
        let mut product = a.deep_clone();
        product.elementwise_product_in_place(&b);
        for component in 0..a.number_of_components() {
            for offset in 0..8 {
                let expected = a.value_at(component, offset) * b.value_at(component, offset);
                prop_assert!(close(product.value_at(component, offset), expected));
            }
        }
    }

    #[test]
    fn empty_clone_is_zero(a in vector(), b in vector()) {
        prop_assert_eq!(a.new_empty_clone().dot_product(&b), 0.0);
        prop_assert!(a.new_empty_clone().value_equals(&ConcatVector::new(0), 0.0));
    }
}

#[test]
fn test_dense_times_sparse() {
    let mut dense = ConcatVector::new(1);
    dense.set_dense_component(0, vec![1.0, 2.0, 3.0]);
    let mut sparse = ConcatVector::new(1);
    sparse.set_sparse_component(0, 1, 5.0);

    dense.elementwise_product_in_place(&sparse);
    let mut expected = ConcatVector::new(1);
    expected.set_dense_component(0, vec![0.0, 10.0, 0.0]);
    assert!(dense.value_equals(&expected, 1e-12));
}
