use candle_core::Device;
use candle_nn::VarMap;
use image::{Rgb, RgbImage};
use sceneseg_core::overlay::{OUTPUT_SUFFIX, Visualizer};
use sceneseg_core::{Canvas, ClassSet, SegNet, Topology};

fn visualizer(classes: &ClassSet) -> Visualizer {
    let varmap = VarMap::new();
    let topology = Topology::vgg_skip_slim(classes.num_outputs(), 32);
    let model = SegNet::new(topology, &varmap, &Device::Cpu, 5).unwrap();
    Visualizer::new(model, classes.clone(), Canvas::new(32, 64), Device::Cpu)
}

fn gradient_image(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, 128]))
}

#[test]
fn overlay_matches_original_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("aachen_000000_000019_leftImg8bit.png");
    gradient_image(50, 30).save(&input).unwrap();

    let classes = ClassSet::new(vec![0, 10, 13]).unwrap();
    let out = visualizer(&classes).segment_image(&input).unwrap();

    let expected = format!("Results/VGG_skip_c3/aachen_000000_000019_leftImg8bit{OUTPUT_SUFFIX}");
    assert!(out.ends_with(expected));
    let written = image::open(&out).unwrap();
    assert_eq!((written.width(), written.height()), (50, 30));
}

#[test]
fn directory_mode_creates_results_and_skips_non_images() {
    let dir = tempfile::tempdir().unwrap();
    gradient_image(64, 32).save(dir.path().join("b.png")).unwrap();
    gradient_image(40, 40).save(dir.path().join("a.jpg")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let classes = ClassSet::new(vec![1, 2]).unwrap();
    let outputs = visualizer(&classes).segment_dir(dir.path()).unwrap();

    assert_eq!(outputs.len(), 2);
    assert!(outputs[0].ends_with("Results/VGG_skip_c2/a_seg.png"));
    assert!(outputs[1].ends_with("Results/VGG_skip_c2/b_seg.png"));
    let a = image::open(&outputs[0]).unwrap();
    assert_eq!((a.width(), a.height()), (40, 40));
}

#[test]
fn undecodable_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.png");
    std::fs::write(&input, b"garbage").unwrap();
    let classes = ClassSet::new(vec![0]).unwrap();
    assert!(visualizer(&classes).segment_image(&input).is_err());
}
