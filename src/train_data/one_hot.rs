use ndarray::Array2;

use super::data_loader::DataError;

/// Encodage one-hot: une ligne par étiquette, un seul 1 à l'indice de la classe
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>, DataError> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));

    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(DataError::LabelOutOfRange { label, num_classes });
        }
        encoded[[row, label]] = 1.0;
    }

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_single_label() {
        let encoded = one_hot(&[3], 10).unwrap();
        assert_eq!(encoded, array![[0., 0., 0., 1., 0., 0., 0., 0., 0., 0.]]);
    }

    #[test]
    fn test_label_out_of_range() {
        assert!(matches!(
            one_hot(&[1, 10], 10),
            Err(DataError::LabelOutOfRange {
                label: 10,
                num_classes: 10
            })
        ));
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(one_hot(&[], 10).unwrap().dim(), (0, 10));
    }

    proptest! {
        #[test]
        fn prop_one_hot_rows(labels in prop::collection::vec(0usize..10, 0..64)) {
            let encoded = one_hot(&labels, 10).unwrap();

            prop_assert_eq!(encoded.dim(), (labels.len(), 10));
            for (row, &label) in encoded.rows().into_iter().zip(&labels) {
                prop_assert_eq!(row.sum(), 1.0);
                prop_assert_eq!(row[label], 1.0);
                prop_assert!(row.iter().all(|&v| v == 0.0 || v == 1.0));
            }
        }
    }
}
