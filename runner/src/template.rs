use crate::{
    config::TemplateConfig,
    path::{encode_coordinate, Coordinate, Segment},
};
use quick_xml::{
    events::{BytesStart, BytesText, Event},
    Reader, Writer,
};
use rayon::prelude::*;
use std::{
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, instrument};

const PARAM: &[u8] = b"param";
const TAG: &[u8] = b"cTag";
const VALUE: &[u8] = b"value";
const GROUP: &[u8] = b"group";
const NAME: &[u8] = b"name";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Template is not valid XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Template has an invalid attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("Failed to write XML: {0}")]
    Io(#[from] io::Error),
    #[error("Template has no parameter with cTag '{0}'")]
    TemplateMalformed(String),
    #[error("Template has no '{tag}' parameter in the '{group}' group")]
    TitleNotFound { group: String, tag: String },
    #[error("Failed to write segment {index} input to {path}: {source}")]
    Write {
        index: usize,
        path: PathBuf,
        source: io::Error,
    },
}

/// File name shared by the materializer, the job script and the combiner
pub fn artifact_name(base: &str, segment: &Segment, extension: &str) -> String {
    format!("{base}_{}.{extension}", segment.encoded())
}

/// `{ x y z }`, the encoding of a coordinate inside a `value` element
pub fn slot_value(coordinate: &Coordinate) -> String {
    format!("{{ {} }}", encode_coordinate(coordinate, " "))
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedSegment {
    pub index: usize,
    pub input: PathBuf,
    pub expected_output: PathBuf,
}

#[derive(Default, Debug)]
/// `cTag` and `value` children of a single `param` element
struct ParamFields {
    tag: Option<String>,
    value: Option<String>,
    // position of the value element relative to the param start
    value_span: Option<(usize, usize)>,
}

/// index of the event closing the element opened at `start`
fn subtree_end(events: &[Event<'static>], start: usize) -> usize {
    let mut depth = 0usize;

    for (offset, event) in events[start..].iter().enumerate() {
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return start + offset;
                }
            }
            _ => {}
        }
    }

    events.len() - 1
}

fn text_of(events: &[Event<'static>]) -> Result<String, TemplateError> {
    let mut text = String::new();

    for event in events {
        match event {
            Event::Text(content) => text.push_str(&content.unescape()?),
            Event::CData(content) => text.push_str(&String::from_utf8_lossy(content)),
            _ => {}
        }
    }

    Ok(text)
}

impl ParamFields {
    /// read the direct children of the param spanning `events`
    fn read(events: &[Event<'static>]) -> Result<Self, TemplateError> {
        let mut fields = Self::default();
        let mut index = 1;

        while index + 1 < events.len() {
            match &events[index] {
                Event::Start(start) => {
                    let end = subtree_end(events, index);

                    match start.name().as_ref() {
                        TAG => fields.tag = Some(text_of(&events[index..=end])?.trim().to_owned()),
                        VALUE => {
                            fields.value = Some(text_of(&events[index..=end])?);
                            fields.value_span = Some((index, end));
                        }
                        _ => {}
                    }

                    index = end + 1;
                }
                Event::Empty(empty) if empty.name().as_ref() == VALUE => {
                    fields.value = Some(String::new());
                    fields.value_span = Some((index, index));
                    index += 1;
                }
                _ => index += 1,
            }
        }

        Ok(fields)
    }
}

#[derive(Debug, Clone)]
/// Parsed XML template, rewritten once per segment
pub struct Template {
    base: String,
    events: Vec<Event<'static>>,
    slots: TemplateConfig,
}

impl Template {
    pub fn load(path: &Path, slots: TemplateConfig) -> Result<Self, TemplateError> {
        let source = fs::read(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .file_stem()
            .unwrap_or(OsStr::new("template"))
            .to_string_lossy()
            .into_owned();

        Self::parse(base, &source, slots)
    }

    pub fn parse(base: String, source: &[u8], slots: TemplateConfig) -> Result<Self, TemplateError> {
        let mut reader = Reader::from_reader(source);
        let mut buffer = Vec::new();
        let mut events = Vec::new();

        loop {
            match reader.read_event_into(&mut buffer)? {
                Event::Eof => break,
                event => events.push(event.into_owned()),
            }
            buffer.clear();
        }

        debug!(base = %base, events = events.len(), "Parsed template");

        Ok(Self {
            base,
            events,
            slots,
        })
    }

    /// file stem of the template, prefix of every artifact
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Copy of the template with the initial and final slots set to the segment's endpoints
    pub fn render(&self, segment: &Segment) -> Result<Vec<u8>, TemplateError> {
        let initial = slot_value(segment.start());
        let last = slot_value(segment.end());
        let mut found = (false, false);
        let mut writer = Writer::new(Vec::new());
        let mut index = 0;

        while index < self.events.len() {
            match &self.events[index] {
                Event::Start(start) if start.name().as_ref() == PARAM => {
                    let end = subtree_end(&self.events, index);
                    let param = &self.events[index..=end];
                    let fields = ParamFields::read(param)?;

                    let replacement = match fields.tag.as_deref() {
                        Some(tag) if tag == self.slots.initial_tag => {
                            found.0 = true;
                            Some(initial.as_str())
                        }
                        Some(tag) if tag == self.slots.final_tag => {
                            found.1 = true;
                            Some(last.as_str())
                        }
                        _ => None,
                    };

                    match (replacement, fields.value_span) {
                        (Some(value), Some(span)) => write_param(&mut writer, param, span, value)?,
                        (Some(_), None) => {
                            return Err(TemplateError::TemplateMalformed(
                                fields.tag.unwrap_or_default(),
                            ))
                        }
                        (None, _) => {
                            for event in param {
                                writer.write_event(event.clone())?;
                            }
                        }
                    }

                    index = end + 1;
                }
                event => {
                    writer.write_event(event.clone())?;
                    index += 1;
                }
            }
        }

        match found {
            (false, _) => Err(TemplateError::TemplateMalformed(self.slots.initial_tag.clone())),
            (_, false) => Err(TemplateError::TemplateMalformed(self.slots.final_tag.clone())),
            _ => Ok(writer.into_inner()),
        }
    }

    /// Material name from the title parameter of the title group, e.g. `GaAs` from `{ GaAs ... }`
    pub fn title(&self) -> Result<String, TemplateError> {
        #[derive(Default)]
        struct Frame {
            title_group: bool,
            named: bool,
            is_name: bool,
            candidate: Option<String>,
        }

        let mut frames: Vec<Frame> = Vec::new();
        let mut index = 0;

        while index < self.events.len() {
            match &self.events[index] {
                Event::Start(start) if start.name().as_ref() == PARAM => {
                    let end = subtree_end(&self.events, index);
                    let fields = ParamFields::read(&self.events[index..=end])?;

                    if fields.tag.as_deref() == Some(self.slots.title_tag.as_str()) {
                        if let Some(group) = frames.iter_mut().rev().find(|frame| frame.title_group)
                        {
                            if group.candidate.is_none() {
                                group.candidate = fields.value.as_deref().and_then(parse_title);
                            }
                        }
                    }

                    index = end + 1;
                    continue;
                }
                Event::Start(start) => {
                    let parent_is_group = frames.last().map_or(false, |frame| frame.title_group);

                    frames.push(Frame {
                        title_group: is_object_group(start)?,
                        is_name: parent_is_group && start.name().as_ref() == NAME,
                        ..Default::default()
                    });
                }
                Event::Text(text) => {
                    if frames.last().map_or(false, |frame| frame.is_name) {
                        let named = text.unescape()?.trim() == self.slots.title_group;
                        let depth = frames.len();

                        if depth >= 2 && named {
                            frames[depth - 2].named = true;
                        }
                    }
                }
                Event::End(_) => {
                    if let Some(frame) = frames.pop() {
                        if frame.title_group && frame.named {
                            if let Some(title) = frame.candidate {
                                return Ok(title);
                            }
                        }
                    }
                }
                _ => {}
            }

            index += 1;
        }

        Err(TemplateError::TitleNotFound {
            group: self.slots.title_group.clone(),
            tag: self.slots.title_tag.clone(),
        })
    }

    /// Write the rewritten template for one segment into `directory`
    pub fn materialize(
        &self,
        segment: &Segment,
        directory: &Path,
    ) -> Result<MaterializedSegment, TemplateError> {
        let content = self.render(segment)?;
        let input = directory.join(artifact_name(&self.base, segment, "xml"));

        fs::write(&input, content).map_err(|source| TemplateError::Write {
            index: segment.index,
            path: input.clone(),
            source,
        })?;
        debug!(segment = segment.index, path = ?input, "Materialized segment");

        Ok(MaterializedSegment {
            index: segment.index,
            expected_output: directory.join(artifact_name(&self.base, segment, "csv")),
            input,
        })
    }

    /// Materialize all segments in parallel, the first failing segment in path order is reported
    #[instrument(skip_all, fields(segments = segments.len()))]
    pub fn materialize_all(
        &self,
        segments: &[Segment],
        directory: &Path,
    ) -> Result<Vec<MaterializedSegment>, TemplateError> {
        segments
            .par_iter()
            .map(|segment| self.materialize(segment, directory))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }
}

fn is_object_group(start: &BytesStart) -> Result<bool, TemplateError> {
    if start.name().as_ref() != GROUP {
        return Ok(false);
    }

    Ok(start
        .try_get_attribute("type")?
        .map_or(false, |attribute| attribute.value.as_ref() == b"obj"))
}

fn parse_title(value: &str) -> Option<String> {
    value
        .trim_matches(|c| c == '{' || c == '}' || c == ' ')
        .split_whitespace()
        .next()
        .map(str::to_owned)
}

/// write `param` with the content of the value element at `span` replaced by `value`
fn write_param(
    writer: &mut Writer<Vec<u8>>,
    param: &[Event<'static>],
    (first, last): (usize, usize),
    value: &str,
) -> Result<(), TemplateError> {
    for event in &param[..first] {
        writer.write_event(event.clone())?;
    }

    match &param[first] {
        Event::Empty(empty) => {
            writer.write_event(Event::Start(empty.clone()))?;
            writer.write_event(Event::Text(BytesText::new(value)))?;
            writer.write_event(Event::End(empty.to_end()))?;
        }
        start => {
            writer.write_event(start.clone())?;
            writer.write_event(Event::Text(BytesText::new(value)))?;
            writer.write_event(param[last].clone())?;
        }
    }

    for event in &param[last + 1..] {
        writer.write_event(event.clone())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathDecomposer, DEFAULT_SYMMETRY_POINTS};

    const TEMPLATE: &str = r#"<?xml version="1.0"?>
<nemo>
  <group type="obj">
    <name>ShapeName_1</name>
    <param><cTag>mat</cTag><value>{ GaAs zincblende }</value></param>
  </group>
  <group type="solver">
    <param><cTag>k0</cTag><value>{ 9 9 9 }</value></param>
    <param><value>{ 8 8 8 }</value><cTag>kf</cTag></param>
    <param><cTag>nk</cTag><value>{ 40 }</value></param>
  </group>
</nemo>
"#;

    fn segments(names: &[&str]) -> Vec<Segment> {
        PathDecomposer::new(&DEFAULT_SYMMETRY_POINTS)
            .decompose(names)
            .unwrap()
    }

    fn template(source: &str) -> Template {
        Template::parse("bulk".to_owned(), source.as_bytes(), TemplateConfig::default()).unwrap()
    }

    #[test]
    fn rewrites_slots_only() {
        let segment = &segments(&["X", "U"])[0];
        let rendered = String::from_utf8(template(TEMPLATE).render(segment).unwrap()).unwrap();

        assert!(rendered.contains("<cTag>k0</cTag><value>{ 0 2 0 }</value>"));
        assert!(rendered.contains("<value>{ 0.5 2 0.5 }</value><cTag>kf</cTag>"));
        assert!(rendered.contains("<cTag>nk</cTag><value>{ 40 }</value>"));
        assert!(rendered.contains("<group type=\"obj\">"));
        assert!(!rendered.contains("{ 9 9 9 }"));
    }

    #[test]
    fn render_is_deterministic() {
        let template = template(TEMPLATE);
        let segment = &segments(&["Γ", "L"])[0];

        assert_eq!(
            template.render(segment).unwrap(),
            template.render(segment).unwrap()
        );
    }

    #[test]
    fn empty_value_element() {
        let source = TEMPLATE.replace("<value>{ 9 9 9 }</value>", "<value/>");
        let segment = &segments(&["Γ", "X"])[0];
        let rendered = String::from_utf8(template(&source).render(segment).unwrap()).unwrap();

        assert!(rendered.contains("<cTag>k0</cTag><value>{ 0 0 0 }</value>"));
    }

    #[test]
    fn missing_slots() {
        let segment = &segments(&["Γ", "X"])[0];

        let no_final = TEMPLATE.replace("<cTag>kf</cTag>", "<cTag>kz</cTag>");
        assert!(matches!(
            template(&no_final).render(segment),
            Err(TemplateError::TemplateMalformed(tag)) if tag == "kf"
        ));

        let no_initial = TEMPLATE.replace("<cTag>k0</cTag>", "");
        assert!(matches!(
            template(&no_initial).render(segment),
            Err(TemplateError::TemplateMalformed(tag)) if tag == "k0"
        ));
    }

    #[test]
    fn title() {
        assert_eq!(template(TEMPLATE).title().unwrap(), "GaAs");
    }

    #[test]
    fn title_requires_named_group() {
        let source = TEMPLATE.replace("ShapeName_1", "ShapeName_2");

        assert!(matches!(
            template(&source).title(),
            Err(TemplateError::TitleNotFound { .. })
        ));
    }

    #[test]
    fn title_name_after_params() {
        let source = TEMPLATE.replace(
            "<name>ShapeName_1</name>\n    <param><cTag>mat</cTag><value>{ GaAs zincblende }</value></param>",
            "<param><cTag>mat</cTag><value>{InAs}</value></param><name>ShapeName_1</name>",
        );

        assert_eq!(template(&source).title().unwrap(), "InAs");
    }

    #[test]
    fn materialize_names() {
        let directory = tempfile::tempdir().unwrap();
        let segments = segments(&["Γ", "X", "L"]);
        let materialized = template(TEMPLATE)
            .materialize_all(&segments, directory.path())
            .unwrap();

        assert_eq!(
            materialized[0].input,
            directory.path().join("bulk_0_0_0to0_2_0.xml")
        );
        assert_eq!(
            materialized[1].expected_output,
            directory.path().join("bulk_0_2_0to1_1_1.csv")
        );
        assert!(materialized.iter().all(|segment| segment.input.is_file()));
    }
}
