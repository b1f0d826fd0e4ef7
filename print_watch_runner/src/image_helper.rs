use image::ImageEncoder;
use print_watch::Frame;
use std::path::Path;

/// Writes the frame's raster as a PNG.
pub fn save(path: &Path, frame: &Frame) -> Result<(), image::ImageError> {
    let output = std::io::BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(
        frame.image().as_raw(),
        frame.width(),
        frame.height(),
        image::ExtendedColorType::Rgb8,
    )?;

    Ok(())
}
