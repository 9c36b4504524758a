//! EXIF metadata extraction
//!
//! A minimal, bounds-checked walker over the JPEG APP1 segment and the
//! TIFF structure inside it. It extracts exactly what the Perception
//! stage can use as metadata clues: the GPS position, the capture
//! timestamp, and the camera model. Extraction is best-effort —
//! malformed EXIF yields empty metadata, never an error, because the
//! metadata path must keep working when everything else is down.

/// Metadata recovered from an image file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifMetadata {
    /// Decimal degrees (lat, lon)
    pub gps: Option<(f64, f64)>,
    /// Raw EXIF timestamp string, e.g. "2023:06:14 10:21:03"
    pub timestamp: Option<String>,
    pub camera_model: Option<String>,
}

impl ExifMetadata {
    pub fn is_empty(&self) -> bool {
        self.gps.is_none() && self.timestamp.is_none() && self.camera_model.is_none()
    }
}

// TIFF field tags we care about
const TAG_MODEL: u16 = 0x0110;
const TAG_DATETIME: u16 = 0x0132;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;
const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
const TAG_GPS_LAT_REF: u16 = 0x0001;
const TAG_GPS_LAT: u16 = 0x0002;
const TAG_GPS_LON_REF: u16 = 0x0003;
const TAG_GPS_LON: u16 = 0x0004;

/// Extract metadata from JPEG bytes. Best-effort; never fails.
pub fn extract_metadata(bytes: &[u8]) -> ExifMetadata {
    find_exif_segment(bytes)
        .and_then(parse_tiff)
        .unwrap_or_default()
}

/// Locate the TIFF blob inside the JPEG's APP1 segment.
fn find_exif_segment(bytes: &[u8]) -> Option<&[u8]> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        // Start-of-scan: no metadata segments past this point
        if marker == 0xDA {
            return None;
        }
        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if length < 2 || pos + 2 + length > bytes.len() {
            return None;
        }
        let body = &bytes[pos + 4..pos + 2 + length];
        if marker == 0xE1 && body.starts_with(b"Exif\0\0") {
            return Some(&body[6..]);
        }
        pos += 2 + length;
    }
    None
}

/// TIFF byte order
#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

/// Cursor over the TIFF blob with bounds-checked reads.
#[derive(Clone, Copy)]
struct Tiff<'a> {
    data: &'a [u8],
    endian: Endian,
}

impl<'a> Tiff<'a> {
    fn u16_at(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(match self.endian {
            Endian::Little => u16::from_le_bytes([b[0], b[1]]),
            Endian::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(match self.endian {
            Endian::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Endian::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    /// Unsigned rational (numerator, denominator) at `offset`.
    fn rational_at(&self, offset: usize) -> Option<(u32, u32)> {
        Some((self.u32_at(offset)?, self.u32_at(offset + 4)?))
    }
}

/// One IFD entry: tag, type, count, and the offset of its value word.
struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Offset of the 4-byte value/offset word within the TIFF blob
    value_offset: usize,
}

const TYPE_ASCII: u16 = 2;
const TYPE_RATIONAL: u16 = 5;

fn type_size(field_type: u16) -> usize {
    match field_type {
        1 | 2 | 7 => 1, // BYTE, ASCII, UNDEFINED
        3 => 2,         // SHORT
        4 | 9 => 4,     // LONG, SLONG
        5 | 10 => 8,    // RATIONAL, SRATIONAL
        _ => 0,
    }
}

impl Entry {
    /// Offset of the entry's data: inline when it fits in 4 bytes,
    /// otherwise pointed to by the value word.
    fn data_offset(&self, tiff: &Tiff<'_>) -> Option<usize> {
        let size = type_size(self.field_type).checked_mul(self.count as usize)?;
        if size == 0 {
            return None;
        }
        if size <= 4 {
            Some(self.value_offset)
        } else {
            tiff.u32_at(self.value_offset).map(|v| v as usize)
        }
    }

    fn ascii(&self, tiff: &Tiff<'_>) -> Option<String> {
        if self.field_type != TYPE_ASCII {
            return None;
        }
        let offset = self.data_offset(tiff)?;
        let bytes = tiff.data.get(offset..offset + self.count as usize)?;
        let text: String = bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        let trimmed = text.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Degrees/minutes/seconds triple as decimal degrees.
    fn dms(&self, tiff: &Tiff<'_>) -> Option<f64> {
        if self.field_type != TYPE_RATIONAL || self.count < 3 {
            return None;
        }
        let offset = self.data_offset(tiff)?;
        let mut parts = [0f64; 3];
        for (i, part) in parts.iter_mut().enumerate() {
            let (num, den) = tiff.rational_at(offset + i * 8)?;
            if den == 0 {
                return None;
            }
            *part = num as f64 / den as f64;
        }
        Some(parts[0] + parts[1] / 60.0 + parts[2] / 3600.0)
    }
}

/// Read the entries of the IFD at `offset`.
fn read_ifd(tiff: &Tiff<'_>, offset: usize) -> Vec<Entry> {
    let Some(count) = tiff.u16_at(offset) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for i in 0..count as usize {
        let base = offset + 2 + i * 12;
        let (Some(tag), Some(field_type), Some(value_count)) = (
            tiff.u16_at(base),
            tiff.u16_at(base + 2),
            tiff.u32_at(base + 4),
        ) else {
            break;
        };
        entries.push(Entry {
            tag,
            field_type,
            count: value_count,
            value_offset: base + 8,
        });
    }
    entries
}

fn parse_tiff(data: &[u8]) -> Option<ExifMetadata> {
    let endian = match data.get(0..2)? {
        b"II" => Endian::Little,
        b"MM" => Endian::Big,
        _ => return None,
    };
    let tiff = Tiff { data, endian };
    if tiff.u16_at(2)? != 42 {
        return None;
    }
    let ifd0_offset = tiff.u32_at(4)? as usize;

    let mut meta = ExifMetadata::default();
    let mut gps_ifd = None;
    let mut exif_ifd = None;

    for entry in read_ifd(&tiff, ifd0_offset) {
        match entry.tag {
            TAG_MODEL => meta.camera_model = entry.ascii(&tiff),
            TAG_DATETIME => {
                if meta.timestamp.is_none() {
                    meta.timestamp = entry.ascii(&tiff);
                }
            }
            TAG_GPS_IFD => gps_ifd = tiff.u32_at(entry.value_offset).map(|v| v as usize),
            TAG_EXIF_IFD => exif_ifd = tiff.u32_at(entry.value_offset).map(|v| v as usize),
            _ => {}
        }
    }

    if let Some(offset) = exif_ifd {
        for entry in read_ifd(&tiff, offset) {
            if entry.tag == TAG_DATETIME_ORIGINAL {
                // DateTimeOriginal is more specific than IFD0's DateTime
                if let Some(ts) = entry.ascii(&tiff) {
                    meta.timestamp = Some(ts);
                }
            }
        }
    }

    if let Some(offset) = gps_ifd {
        meta.gps = parse_gps(&tiff, offset);
    }

    Some(meta)
}

fn parse_gps(tiff: &Tiff<'_>, offset: usize) -> Option<(f64, f64)> {
    let mut lat = None;
    let mut lon = None;
    let mut lat_sign = 1.0;
    let mut lon_sign = 1.0;

    for entry in read_ifd(tiff, offset) {
        match entry.tag {
            TAG_GPS_LAT_REF => {
                if entry.ascii(tiff).as_deref() == Some("S") {
                    lat_sign = -1.0;
                }
            }
            TAG_GPS_LON_REF => {
                if entry.ascii(tiff).as_deref() == Some("W") {
                    lon_sign = -1.0;
                }
            }
            TAG_GPS_LAT => lat = entry.dms(tiff),
            TAG_GPS_LON => lon = entry.dms(tiff),
            _ => {}
        }
    }

    let (lat, lon) = (lat? * lat_sign, lon? * lon_sign);
    (sdk::geo::is_valid_lat(lat) && sdk::geo::is_valid_lon(lon)).then_some((lat, lon))
}
