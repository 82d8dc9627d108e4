//! Integration Tests
//!
//! End-to-end tests for segmentations: conversion, invalidation, layers and
//! geometry round trips.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use glam::{DMat3, DVec3};
use pretty_assertions::assert_eq;

use segcore::conversion::rules::{default_rules, BinaryLabelmapToClosedSurface};
use segcore::conversion::{ConversionParameters, ConversionRule, Converter};
use segcore::image::resample::merge_image;
use segcore::image::{deserialize_image_geometry, serialize_image_geometry, MergeOperation};
use segcore::{
    Extent, OrientedImage, Representation, RepresentationRef, Result, ScalarType, Segment,
    Segmentation, SegmentationEvent, BINARY_LABELMAP, CLOSED_SURFACE, FRACTIONAL_LABELMAP,
};

/// Helper to create a 10x10x10 labelmap with a filled box
fn block(filled: Extent) -> OrientedImage {
    let mut image = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 9), ScalarType::U8);
    for [i, j, k] in filled.iter() {
        image.set_value(i, j, k, 1.0);
    }
    image
}

fn add_block(segmentation: &mut Segmentation, id: &str, filled: Extent) -> String {
    segmentation
        .add_segment(
            Segment::new(id).with_representation(BINARY_LABELMAP, block(filled)),
            Some(id),
            None,
        )
        .unwrap()
}

/// Binary to surface rule that counts its conversions
#[derive(Clone)]
struct CountingRule {
    inner: BinaryLabelmapToClosedSurface,
    calls: Arc<AtomicUsize>,
}

impl ConversionRule for CountingRule {
    fn source_representation_name(&self) -> &'static str {
        self.inner.source_representation_name()
    }

    fn target_representation_name(&self) -> &'static str {
        self.inner.target_representation_name()
    }

    fn conversion_cost(&self) -> u32 {
        self.inner.conversion_cost()
    }

    fn parameters(&self) -> &ConversionParameters {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> &mut ConversionParameters {
        self.inner.parameters_mut()
    }

    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.convert(source)
    }

    fn box_clone(&self) -> Box<dyn ConversionRule> {
        Box::new(self.clone())
    }
}

// === End-to-end scenarios ===

#[test]
fn test_empty_labelmap_converts_to_empty_surface() {
    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    let empty = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 9), ScalarType::U8);
    let id = segmentation
        .add_segment(
            Segment::new("S1").with_representation(BINARY_LABELMAP, empty),
            None,
            None,
        )
        .unwrap();

    segmentation
        .create_representation(CLOSED_SURFACE, false)
        .unwrap();

    match segmentation.segment_representation(&id, CLOSED_SURFACE) {
        Some(RepresentationRef::Mesh(mesh)) => assert_eq!(mesh.number_of_polygons(), 0),
        _ => panic!("closed surface missing"),
    }
}

#[test]
fn test_collapse_then_query_labels() {
    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    add_block(&mut segmentation, "S1", Extent::new(0, 2, 0, 2, 0, 2));
    segmentation
        .add_segment(
            Segment::new("S2")
                .with_label_value(2)
                .with_representation(BINARY_LABELMAP, block(Extent::new(6, 8, 6, 8, 6, 8))),
            Some("S2"),
            None,
        )
        .unwrap();

    segmentation.collapse_binary_labelmaps(false).unwrap();
    assert_eq!(segmentation.number_of_layers(BINARY_LABELMAP), 1);

    let layer = segmentation.layer_handle("S1").unwrap();
    let s1_mask = block(Extent::new(0, 2, 0, 2, 0, 2));
    let s2_mask = block(Extent::new(6, 8, 6, 8, 6, 8));
    let s1: Vec<i64> = segmentation
        .label_values_in_mask(layer, &s1_mask, None)
        .unwrap()
        .into_iter()
        .collect();
    let s2: Vec<i64> = segmentation
        .label_values_in_mask(layer, &s2_mask, None)
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(s1, vec![1]);
    assert_eq!(s2, vec![2]);
}

#[test]
fn test_geometry_string_round_trip() {
    let image = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 4), ScalarType::U8)
        .with_origin(DVec3::new(1.0, 2.0, 3.0))
        .with_spacing(DVec3::new(0.5, 0.5, 1.0));

    let text = serialize_image_geometry(&image);
    let geometry = deserialize_image_geometry(&text).unwrap();

    let origin = geometry.origin();
    let spacing = geometry.spacing();
    assert_relative_eq!(origin.x, 1.0, epsilon = 1e-4);
    assert_relative_eq!(origin.y, 2.0, epsilon = 1e-4);
    assert_relative_eq!(origin.z, 3.0, epsilon = 1e-4);
    assert_relative_eq!(spacing.x, 0.5, epsilon = 1e-4);
    assert_relative_eq!(spacing.y, 0.5, epsilon = 1e-4);
    assert_relative_eq!(spacing.z, 1.0, epsilon = 1e-4);
    let directions = geometry.directions();
    for col in 0..3 {
        let expected = DMat3::IDENTITY.col(col);
        assert_relative_eq!(directions.col(col).distance(expected), 0.0, epsilon = 1e-4);
    }
    assert_eq!(geometry.extent, Extent::new(0, 9, 0, 9, 0, 4));
}

// === Properties ===

#[test]
fn test_cheapest_path_is_minimal() {
    let converter = Converter::with_rules(default_rules());
    let names = [BINARY_LABELMAP, FRACTIONAL_LABELMAP, CLOSED_SURFACE];
    for source in names {
        for target in names {
            if source == target {
                continue;
            }
            let paths = converter.find_paths(source, target).unwrap();
            let Some(cheapest) = Converter::cheapest_path(&paths) else {
                continue;
            };
            for path in &paths {
                assert!(cheapest.cost() <= path.cost(), "{} -> {}", source, target);
            }
        }
    }
}

#[test]
fn test_create_representation_twice_runs_rules_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counting = CountingRule {
        inner: BinaryLabelmapToClosedSurface::new(),
        calls: Arc::clone(&calls),
    };
    let mut converter = Converter::new();
    converter.add_rule(Box::new(counting));
    let mut segmentation = Segmentation::with_converter(BINARY_LABELMAP, converter);
    add_block(&mut segmentation, "a", Extent::new(2, 5, 2, 5, 2, 5));
    add_block(&mut segmentation, "b", Extent::new(6, 8, 6, 8, 6, 8));

    segmentation
        .create_representation(CLOSED_SURFACE, false)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    segmentation
        .create_representation(CLOSED_SURFACE, false)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    segmentation
        .create_representation(CLOSED_SURFACE, true)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_master_write_invalidates_until_recreated() {
    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    add_block(&mut segmentation, "a", Extent::new(2, 5, 2, 5, 2, 5));
    segmentation
        .create_representation(CLOSED_SURFACE, false)
        .unwrap();
    let events = segmentation.subscribe();

    segmentation
        .modify_labelmap("a", |image| {
            image.set_value(7, 7, 7, 1.0);
        })
        .unwrap();
    assert!(segmentation
        .segment_representation("a", CLOSED_SURFACE)
        .is_none());
    assert_eq!(
        events.try_recv().unwrap(),
        SegmentationEvent::MasterRepresentationModified {
            segment_ids: vec!["a".to_string()]
        }
    );

    segmentation
        .create_representation(CLOSED_SURFACE, false)
        .unwrap();
    assert!(segmentation
        .segment_representation("a", CLOSED_SURFACE)
        .is_some());
}

#[test]
fn test_merge_then_separate_round_trip() {
    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    add_block(&mut segmentation, "a", Extent::new(1, 3, 1, 4, 1, 2));
    add_block(&mut segmentation, "b", Extent::new(6, 8, 6, 8, 6, 8));
    let before = segmentation.segment_labelmap("a").unwrap();

    segmentation
        .merge_segment_labelmaps(&["a".to_string(), "b".to_string()])
        .unwrap();
    segmentation.separate_segment_labelmap("a").unwrap();

    let after = segmentation.segment_labelmap("a").unwrap();
    for [i, j, k] in before.extent().iter() {
        assert_eq!(after.value(i, j, k), before.value(i, j, k), "voxel {} {} {}", i, j, k);
    }
    assert_eq!(after.count_non_zero(), before.count_non_zero());
    assert_eq!(segmentation.segment_labelmap("b").unwrap().count_non_zero(), 27);
}

#[test]
fn test_max_merge_commutative_and_idempotent() {
    let x = block(Extent::new(0, 4, 0, 4, 0, 4));
    let mut y = OrientedImage::new(Extent::new(3, 12, 3, 12, 3, 12), ScalarType::U8);
    for [i, j, k] in Extent::new(3, 7, 3, 7, 3, 7).iter() {
        y.set_value(i, j, k, 1.0);
    }

    let (xy, _) = merge_image(&x, &y, MergeOperation::Maximum, None, 0.0, 1.0).unwrap();
    let (yx, _) = merge_image(&y, &x, MergeOperation::Maximum, None, 0.0, 1.0).unwrap();
    assert_eq!(xy.extent(), yx.extent());
    assert_eq!(xy.scalars(), yx.scalars());

    let (xx, modified) = merge_image(&x, &x, MergeOperation::Maximum, None, 0.0, 1.0).unwrap();
    assert!(!modified);
    assert_eq!(xx, x);
}

// === Mixed pipelines ===

#[test]
fn test_surface_master_to_fractional_and_back() {
    let mut segmentation = Segmentation::new(CLOSED_SURFACE);
    let cube = segcore::ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(3.5));
    let id = segmentation
        .add_segment(
            Segment::new("cube").with_representation(CLOSED_SURFACE, cube),
            None,
            None,
        )
        .unwrap();

    segmentation
        .create_representation(FRACTIONAL_LABELMAP, false)
        .unwrap();
    match segmentation.segment_representation(&id, FRACTIONAL_LABELMAP) {
        Some(RepresentationRef::Raster(fractions)) => {
            assert_eq!(fractions.scalar_type(), ScalarType::F32);
            assert_eq!(fractions.count_value(1.0), 64);
        }
        _ => panic!("fractional labelmap missing"),
    }

    segmentation
        .create_representation(BINARY_LABELMAP, false)
        .unwrap();
    assert_eq!(segmentation.segment_labelmap(&id).unwrap().count_non_zero(), 64);
    assert_eq!(
        segmentation.contained_representation_names(),
        vec![
            BINARY_LABELMAP.to_string(),
            CLOSED_SURFACE.to_string(),
            FRACTIONAL_LABELMAP.to_string()
        ]
    );
}

#[test]
fn test_segments_share_reference_geometry() {
    let mut segmentation = Segmentation::new(CLOSED_SURFACE);
    for (name, min, max) in [
        ("left", DVec3::ZERO, DVec3::splat(2.0)),
        ("right", DVec3::new(5.0, 0.0, 0.0), DVec3::new(7.0, 2.0, 2.0)),
    ] {
        segmentation
            .add_segment(
                Segment::new(name)
                    .with_representation(CLOSED_SURFACE, segcore::ClosedSurface::cuboid(min, max)),
                Some(name),
                None,
            )
            .unwrap();
    }
    segmentation
        .create_representation(BINARY_LABELMAP, false)
        .unwrap();

    let left = segmentation.segment_labelmap("left").unwrap();
    let right = segmentation.segment_labelmap("right").unwrap();
    assert_eq!(left.image_to_world_matrix(), right.image_to_world_matrix());
    assert!(left.count_non_zero() > 0);
    assert!(right.count_non_zero() > 0);
}

#[test]
fn test_batch_events_flush_once() {
    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    add_block(&mut segmentation, "a", Extent::new(0, 1, 0, 1, 0, 1));
    add_block(&mut segmentation, "b", Extent::new(4, 5, 4, 5, 4, 5));
    let events = segmentation.subscribe();

    segmentation.start_modify();
    segmentation.start_modify();
    segmentation
        .modify_labelmap("a", |image| image.fill(0.0))
        .unwrap();
    segmentation.end_modify();
    segmentation
        .modify_labelmap("b", |image| image.fill(0.0))
        .unwrap();
    assert!(events.try_recv().is_err());
    segmentation.end_modify();

    let received: Vec<_> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![SegmentationEvent::MasterRepresentationModified {
            segment_ids: vec!["a".to_string(), "b".to_string()]
        }]
    );
}
