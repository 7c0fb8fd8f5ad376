//! Tile stitching.
//!
//! Tile jobs are named `..._Tile_<ty>_<tx>` with tile row 0 at the *bottom*
//! of the image (the renderer's border coordinates grow upward), so the
//! vertical paste position is flipped when compositing onto the top-down
//! canvas.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use image::{ImageFormat, ImageReader, RgbaImage, imageops};
use regex::Regex;

pub(crate) struct TileInput {
    pub job_name: String,
    pub path: PathBuf,
}

pub(crate) struct StitchSpec {
    pub tiles: Vec<TileInput>,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub width: u32,
    pub height: u32,
}

fn tile_coord_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_Tile_(\d+)_(\d+)$").unwrap())
}

/// Extract `(ty, tx)` from a tile job name.
pub(crate) fn parse_tile_coords(name: &str) -> Option<(u32, u32)> {
    let caps = tile_coord_regex().captures(name)?;
    let ty = caps.get(1)?.as_str().parse().ok()?;
    let tx = caps.get(2)?.as_str().parse().ok()?;
    Some((ty, tx))
}

pub(crate) fn stitch(spec: &StitchSpec) -> anyhow::Result<RgbaImage> {
    let expected = (spec.tiles_x * spec.tiles_y) as usize;
    if spec.tiles.len() != expected {
        anyhow::bail!(
            "expected {expected} tiles, have {} to assemble",
            spec.tiles.len()
        );
    }

    let tile_w = spec.width / spec.tiles_x;
    let tile_h = spec.height / spec.tiles_y;
    let mut canvas = RgbaImage::new(spec.width, spec.height);

    for tile in &spec.tiles {
        let (ty, tx) = parse_tile_coords(&tile.job_name)
            .with_context(|| format!("cannot parse tile coordinates from {:?}", tile.job_name))?;
        if tx >= spec.tiles_x || ty >= spec.tiles_y {
            anyhow::bail!(
                "tile {:?} is outside the {}x{} grid",
                tile.job_name,
                spec.tiles_x,
                spec.tiles_y
            );
        }

        let tile_image = ImageReader::open(&tile.path)
            .with_context(|| format!("opening tile output {}", tile.path.display()))?
            .decode()
            .with_context(|| format!("decoding tile output {}", tile.path.display()))?
            .to_rgba8();

        let paste_x = (tx * tile_w) as i64;
        let paste_y = ((spec.tiles_y - 1 - ty) * tile_h) as i64;
        imageops::replace(&mut canvas, &tile_image, paste_x, paste_y);
    }

    Ok(canvas)
}

pub(crate) fn encode_png(image: &RgbaImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .context("encoding assembled image")?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid_tile(dir: &std::path::Path, name: &str, color: [u8; 4], size: u32) -> TileInput {
        let mut img = RgbaImage::new(size, size);
        for px in img.pixels_mut() {
            *px = Rgba(color);
        }
        let path = dir.join(format!("{name}.png"));
        img.save(&path).unwrap();
        TileInput {
            job_name: name.to_string(),
            path,
        }
    }

    #[test]
    fn parses_trailing_tile_coordinates() {
        assert_eq!(parse_tile_coords("Big Render_Tile_1_0"), Some((1, 0)));
        assert_eq!(parse_tile_coords("anim_Frame_0003_Tile_2_1"), Some((2, 1)));
        assert_eq!(parse_tile_coords("Tile_1_0_extra"), None);
        assert_eq!(parse_tile_coords("no tiles here"), None);
    }

    #[test]
    fn two_by_two_quadrants_land_with_flipped_y() {
        let tmp = tempfile::TempDir::new().unwrap();
        const RED: [u8; 4] = [255, 0, 0, 255];
        const GREEN: [u8; 4] = [0, 255, 0, 255];
        const BLUE: [u8; 4] = [0, 0, 255, 255];
        const YELLOW: [u8; 4] = [255, 255, 0, 255];

        // Tile row 0 is the bottom of the image: (ty=1, tx=0) is top-left.
        let spec = StitchSpec {
            tiles: vec![
                solid_tile(tmp.path(), "t_Tile_1_0", RED, 200),
                solid_tile(tmp.path(), "t_Tile_1_1", GREEN, 200),
                solid_tile(tmp.path(), "t_Tile_0_0", BLUE, 200),
                solid_tile(tmp.path(), "t_Tile_0_1", YELLOW, 200),
            ],
            tiles_x: 2,
            tiles_y: 2,
            width: 400,
            height: 400,
        };

        let out = stitch(&spec).unwrap();
        assert_eq!(out.dimensions(), (400, 400));
        assert_eq!(out.get_pixel(100, 100).0, RED); // top-left
        assert_eq!(out.get_pixel(300, 100).0, GREEN); // top-right
        assert_eq!(out.get_pixel(100, 300).0, BLUE); // bottom-left
        assert_eq!(out.get_pixel(300, 300).0, YELLOW); // bottom-right
    }

    #[test]
    fn missing_tile_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spec = StitchSpec {
            tiles: vec![solid_tile(tmp.path(), "t_Tile_0_0", [1, 2, 3, 255], 10)],
            tiles_x: 2,
            tiles_y: 2,
            width: 20,
            height: 20,
        };
        assert!(stitch(&spec).is_err());
    }

    #[test]
    fn malformed_tile_name_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut tiles = vec![
            solid_tile(tmp.path(), "t_Tile_0_0", [0; 4], 10),
            solid_tile(tmp.path(), "t_Tile_0_1", [0; 4], 10),
            solid_tile(tmp.path(), "t_Tile_1_0", [0; 4], 10),
            solid_tile(tmp.path(), "t_Tile_1_1", [0; 4], 10),
        ];
        tiles[3].job_name = "not a tile".to_string();
        let spec = StitchSpec {
            tiles,
            tiles_x: 2,
            tiles_y: 2,
            width: 20,
            height: 20,
        };
        assert!(stitch(&spec).is_err());
    }
}
