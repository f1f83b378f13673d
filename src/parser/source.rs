//! Descriptor source representation

use crate::error::{ErrorReported, FileIOError};

#[derive(PartialEq, Eq, Debug)]
pub struct SourceCode<'a> {
    pub file_path: Option<&'a str>,
    /// UTF-8 encoded descriptor text
    src: String,
    /// Offsets of each line
    line_offsets: Vec<usize>,
}

impl<'a> SourceCode<'a> {
    pub fn new(src: String) -> Self {
        let line_offsets = src
            .split('\n')
            .scan(0, |offset, line| {
                let old_offset = *offset;
                *offset += line.len() + 1;
                Some(old_offset)
            })
            .collect::<Vec<_>>();
        SourceCode {
            file_path: None,
            src,
            line_offsets,
        }
    }

    pub fn from_file(file_path: &'a str) -> Result<Self, ErrorReported> {
        match std::fs::read_to_string(file_path) {
            Ok(src) => {
                let mut source = SourceCode::new(src);
                source.file_path = Some(file_path);
                Ok(source)
            }
            Err(io_error) => Err(FileIOError::new(file_path, io_error).emit()),
        }
    }

    pub fn str(&self) -> &str {
        &self.src
    }

    /// Line and column (both 1-based) of an offset into the source.
    pub fn get_line_col(&self, offset: usize) -> Option<(usize, usize)> {
        if offset > self.src.len() {
            return None;
        }
        let mut line_num = 1;
        let mut line_off = 0;
        for (i, line_offset) in self.line_offsets.iter().enumerate().rev() {
            if *line_offset <= offset {
                line_num = i + 1;
                line_off = *line_offset;
                break;
            }
        }
        Some((line_num, offset - line_off + 1))
    }

    /// The text of line `line_num` (1-based), without its newline.
    pub fn get_line(&self, line_num: usize) -> Option<&str> {
        let begin = *self.line_offsets.get(line_num.checked_sub(1)?)?;
        let end = match self.line_offsets.get(line_num) {
            Some(next) => next - 1,
            None => self.src.len(),
        };
        self.src.get(begin..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let src_file = SourceCode::new(String::new());
        assert_eq!(src_file.line_offsets, vec![0], "cannot handle empty source");
        assert_eq!(
            src_file.get_line_col(0),
            Some((1, 1)),
            "cannot get line and column in empty source"
        );
    }

    #[test]
    fn multi_line() {
        let src_file = SourceCode::new(String::from("first,\nsecond\nthird\nend"));
        assert_eq!(src_file.line_offsets, vec![0, 7, 14, 20]);
        assert_eq!(src_file.get_line_col(8), Some((2, 2)));
        assert_eq!(src_file.get_line_col(22), Some((4, 3)));
        assert_eq!(src_file.get_line_col(100), None);
        assert_eq!(src_file.get_line(2), Some("second"));
        assert_eq!(src_file.get_line(4), Some("end"));
        assert_eq!(src_file.get_line(5), None);
        assert_eq!(src_file.get_line(0), None);
    }
}
