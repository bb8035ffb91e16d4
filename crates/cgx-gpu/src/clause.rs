//! Draw clause: accumulated description of the next draw operation.
//!
//! The clause lives through one begin/end pair only. It is created
//! empty on "begin", appended to by draw-range registers, compiled
//! right before dispatch to the renderer, and reset on "end".

/// How the current draw sources its vertices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawCommand {
    #[default]
    None,
    Array,
    Indexed,
    InlinedArray,
}

/// Primitive topology codes as carried by the begin register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Points = 1,
    Lines = 2,
    LineLoop = 3,
    LineStrip = 4,
    Triangles = 5,
    TriangleStrip = 6,
    TriangleFan = 7,
    Quads = 8,
    QuadStrip = 9,
    Polygon = 10,
}

impl Primitive {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Points),
            2 => Some(Self::Lines),
            3 => Some(Self::LineLoop),
            4 => Some(Self::LineStrip),
            5 => Some(Self::Triangles),
            6 => Some(Self::TriangleStrip),
            7 => Some(Self::TriangleFan),
            8 => Some(Self::Quads),
            9 => Some(Self::QuadStrip),
            10 => Some(Self::Polygon),
            _ => None,
        }
    }
}

/// Transient per-draw state
#[derive(Debug, Default)]
pub struct DrawClause {
    /// A begin has been seen without its matching end. This is set even
    /// for an unrecognized primitive code, to keep pairing intact.
    pub in_begin_end: bool,
    pub command: DrawCommand,
    pub primitive: Option<Primitive>,
    /// Ordered (first, count) vertex/index ranges
    pub ranges: Vec<(u32, u32)>,
    /// Raw vertex words pushed through the inline-array register
    pub inline_vertex_words: Vec<u32>,
    /// Indices pushed through the array-element registers
    pub immediate_indices: Vec<u32>,
    /// Vertices completed per attribute through the immediate path
    immediate_attr_counts: [u32; super::regs::VERTEX_ATTRIBUTES],
    /// The draw was synthesized from immediate-mode pushes
    pub is_immediate_draw: bool,
    pub compiled: bool,
}

impl DrawClause {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the accumulating state for a recognized primitive
    pub fn begin(&mut self, primitive: Primitive) {
        self.reset();
        self.in_begin_end = true;
        self.primitive = Some(primitive);
    }

    /// Enter begin/end pairing without clause content (unrecognized
    /// primitive code)
    pub fn begin_unrecognized(&mut self) {
        self.reset();
        self.in_begin_end = true;
    }

    /// Append a (first, count) range from a draw-range register.
    /// Always accepted; a source-kind conflict is logged and the range
    /// keeps the first kind seen.
    pub fn append_range(&mut self, kind: DrawCommand, first: u32, count: u32) {
        if self.command == DrawCommand::None {
            self.command = kind;
        } else if self.command != kind {
            tracing::warn!(
                "draw command kind changed mid-clause ({:?} -> {:?}); keeping {:?}",
                self.command,
                kind,
                self.command
            );
        }
        self.ranges.push((first, count));
    }

    /// Append raw inline vertex words
    pub fn append_inline_words(&mut self, words: impl IntoIterator<Item = u32>) {
        if self.command == DrawCommand::None {
            self.command = DrawCommand::InlinedArray;
        }
        self.inline_vertex_words.extend(words);
    }

    /// Record one component word of an immediate-mode vertex attribute.
    /// A vertex is complete once its w component (subregister 3) lands.
    pub fn push_immediate_word(&mut self, attribute: u32, component: u32, _value: u32) {
        if component == 3 {
            if let Some(count) = self.immediate_attr_counts.get_mut(attribute as usize) {
                *count += 1;
            }
        }
    }

    /// Record an immediate-mode index
    pub fn push_index(&mut self, index: u32) {
        self.immediate_indices.push(index);
    }

    /// Vertices completed through the immediate path (any attribute may
    /// carry position, so take the maximum)
    pub fn immediate_vertex_count(&self) -> u32 {
        self.immediate_attr_counts.iter().copied().max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
            && self.inline_vertex_words.is_empty()
            && self.immediate_indices.is_empty()
            && self.immediate_vertex_count() == 0
    }

    /// Finalize the clause for dispatch: synthesize the implicit
    /// immediate-mode range if no draw-range register was issued, then
    /// merge consecutive ranges.
    pub fn compile(&mut self) {
        if self.ranges.is_empty() {
            // Indexed range preferred over array range if both exist
            if !self.immediate_indices.is_empty() {
                self.command = DrawCommand::Indexed;
                self.ranges.push((0, self.immediate_indices.len() as u32));
                self.is_immediate_draw = true;
            } else if self.immediate_vertex_count() > 0 {
                self.command = DrawCommand::Array;
                self.ranges.push((0, self.immediate_vertex_count()));
                self.is_immediate_draw = true;
            }
        }

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(first, count) in &self.ranges {
            match merged.last_mut() {
                Some((mfirst, mcount)) if *mfirst + *mcount == first => *mcount += count,
                _ => merged.push((first, count)),
            }
        }
        self.ranges = merged;
        self.compiled = true;
    }

    /// Total element count across compiled ranges
    pub fn element_count(&self) -> u32 {
        self.ranges.iter().map(|&(_, count)| count).sum()
    }

    /// Back to the idle state; nothing persists across draws
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
