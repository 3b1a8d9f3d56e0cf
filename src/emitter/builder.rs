// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use log::{debug, warn};

use crate::code::{CodeContainer, Label};
use crate::const_pool::ConstPool;
use crate::emitter::compiler::{FuncData, FuncRetData, InvokeData, JumpData};
use crate::emitter::{AlignMode, Assembler, Emitter, EmitterState, EmitOptions, InstId};
use crate::operand::{Operand, Reg, TypeId};
use crate::{CodeError, EmitterKind};

const MAX_ALIGNMENT: u32 = 64;

/// Handle to a node in a builder's graph. Nodes live in the graph arena
/// until the builder is dropped; removal only unlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub(crate) const fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstData {
    pub inst: InstId,
    pub options: EmitOptions,
    pub extra_reg: Option<Reg>,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    Generic,
    /// Marks the end of a function region opened by a func node.
    FuncEnd,
}

/// Payload of one graph node.
#[derive(Debug)]
pub enum NodeKind {
    Inst(InstData),
    Label(Label),
    Align {
        mode: AlignMode,
        alignment: u32,
    },
    EmbedData {
        type_id: Option<TypeId>,
        data: Vec<u8>,
        repeat_count: usize,
    },
    EmbedLabel(Label),
    EmbedLabelDelta {
        label: Label,
        base: Label,
        width: u8,
    },
    EmbedConstPool {
        label: Label,
        pool: ConstPool,
    },
    Comment(String),
    Sentinel(SentinelKind),
    Func(Box<FuncData>),
    FuncRet(FuncRetData),
    Invoke(Box<InvokeData>),
    Jump(JumpData),
}

/// One unit of a builder graph: doubly-linked neighbors plus a typed
/// payload, an optional source position and an inline comment.
#[derive(Debug)]
pub struct Node {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    linked: bool,
    position: Option<u32>,
    comment: Option<String>,
    kind: NodeKind,
}

impl Node {
    #[must_use]
    pub const fn prev(&self) -> Option<NodeId> {
        self.prev
    }

    #[must_use]
    pub const fn next(&self) -> Option<NodeId> {
        self.next
    }

    #[must_use]
    pub const fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[must_use]
    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    #[must_use]
    pub const fn position(&self) -> Option<u32> {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        self.position = Some(position);
    }

    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = Some(comment.to_string());
    }
}

/// A named rewrite over the node graph, run by `finalize` in registration
/// order. Passes own whatever scratch state they need.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&mut self, builder: &mut Builder) -> Result<(), CodeError>;
}

/// Records emits as nodes in a doubly-linked graph instead of encoding
/// them, so the stream can be inspected and rewritten before it is
/// serialized onto an assembler at `finalize` time.
pub struct Builder<'code> {
    code: &'code mut CodeContainer,
    kind: EmitterKind,
    state: EmitterState,
    nodes: Vec<Node>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    cursor: Option<NodeId>,
    passes: Vec<Box<dyn Pass>>,
}

impl<'code> Builder<'code> {
    pub fn attach(code: &'code mut CodeContainer) -> Result<Self, CodeError> {
        Self::attach_with_kind(code, EmitterKind::Builder)
    }

    pub(crate) fn attach_with_kind(code: &'code mut CodeContainer, kind: EmitterKind) -> Result<Self, CodeError> {
        Ok(Self {
            code,
            kind,
            state: EmitterState::new(),
            nodes: Vec::new(),
            head: None,
            tail: None,
            cursor: None,
            passes: Vec::new(),
        })
    }

    //
    // Graph access
    //

    #[must_use]
    pub const fn head(&self) -> Option<NodeId> {
        self.head
    }

    #[must_use]
    pub const fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    #[must_use]
    pub const fn cursor(&self) -> Option<NodeId> {
        self.cursor
    }

    /// Moves the append position; `None` prepends before the current head.
    /// Returns the previous cursor.
    pub fn set_cursor(&mut self, cursor: Option<NodeId>) -> Option<NodeId> {
        std::mem::replace(&mut self.cursor, cursor)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, CodeError> {
        self.nodes.get(id.index()).ok_or(CodeError::InvalidArgument)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, CodeError> {
        self.nodes.get_mut(id.index()).ok_or(CodeError::InvalidArgument)
    }

    /// Number of nodes ever allocated, including unlinked ones.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    //
    // Node allocation & topology
    //

    /// Allocates a node without linking it into the graph.
    pub fn new_node(&mut self, kind: NodeKind) -> Result<NodeId, CodeError> {
        self.nodes.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = NodeId(u32::try_from(self.nodes.len()).map_err(|_| CodeError::OutOfMemory)?);
        self.nodes.push(Node {
            prev: None,
            next: None,
            linked: false,
            position: None,
            comment: None,
            kind,
        });

        Ok(id)
    }

    /// Inserts an allocated node after the cursor and moves the cursor onto
    /// it, so consecutive appends stay in emit order.
    pub fn add_node(&mut self, id: NodeId) -> Result<NodeId, CodeError> {
        match self.cursor {
            Some(cursor) => self.insert_after(id, cursor)?,
            None => self.insert_at_head(id)?,
        }

        self.cursor = Some(id);
        Ok(id)
    }

    fn check_unlinked(&self, id: NodeId) -> Result<(), CodeError> {
        let node = self.node(id)?;
        if node.linked {
            return Err(CodeError::InvalidArgument);
        }
        Ok(())
    }

    fn insert_at_head(&mut self, id: NodeId) -> Result<(), CodeError> {
        self.check_unlinked(id)?;

        let old_head = self.head;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = None;
            node.next = old_head;
            node.linked = true;
        }

        match old_head {
            Some(head) => self.nodes[head.index()].prev = Some(id),
            None => self.tail = Some(id),
        }

        self.head = Some(id);
        Ok(())
    }

    pub fn insert_after(&mut self, id: NodeId, after: NodeId) -> Result<(), CodeError> {
        self.check_unlinked(id)?;

        let next = self.node(after)?.next;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = Some(after);
            node.next = next;
            node.linked = true;
        }

        self.nodes[after.index()].next = Some(id);
        match next {
            Some(next) => self.nodes[next.index()].prev = Some(id),
            None => self.tail = Some(id),
        }

        Ok(())
    }

    pub fn insert_before(&mut self, id: NodeId, before: NodeId) -> Result<(), CodeError> {
        self.check_unlinked(id)?;

        let prev = self.node(before)?.prev;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.next = Some(before);
            node.linked = true;
        }

        self.nodes[before.index()].prev = Some(id);
        match prev {
            Some(prev) => self.nodes[prev.index()].next = Some(id),
            None => self.head = Some(id),
        }

        Ok(())
    }

    /// Unlinks a node. The node stays allocated and can be re-inserted.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), CodeError> {
        let (prev, next, linked) = {
            let node = self.node(id)?;
            (node.prev, node.next, node.linked)
        };

        if !linked {
            return Err(CodeError::InvalidArgument);
        }

        match prev {
            Some(prev) => self.nodes[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next.index()].prev = prev,
            None => self.tail = prev,
        }

        if self.cursor == Some(id) {
            self.cursor = prev;
        }

        let node = &mut self.nodes[id.index()];
        node.prev = None;
        node.next = None;
        node.linked = false;
        Ok(())
    }

    /// Unlinks `first..=last`, which must be in order within the graph.
    pub fn remove_range(&mut self, first: NodeId, last: NodeId) -> Result<(), CodeError> {
        let mut current = Some(first);

        while let Some(id) = current {
            let next = self.node(id)?.next;
            self.remove_node(id)?;

            if id == last {
                return Ok(());
            }
            current = next;
        }

        // `last` was never reached, so the arguments were not in order.
        Err(CodeError::InvalidArgument)
    }

    //
    // Typed allocate+append helpers
    //

    fn take_per_inst_comment(&mut self) -> Option<String> {
        self.state.take_inline_comment()
    }

    pub(crate) fn add_kind(&mut self, kind: NodeKind) -> Result<NodeId, CodeError> {
        let comment = self.take_per_inst_comment();
        let id = self.new_node(kind)?;
        if let Some(comment) = comment {
            self.nodes[id.index()].comment = Some(comment);
        }
        self.add_node(id)
    }

    pub fn add_label_node(&mut self, label: Label) -> Result<NodeId, CodeError> {
        if !self.code.is_label_valid(label) {
            return Err(CodeError::InvalidLabel);
        }
        self.add_kind(NodeKind::Label(label))
    }

    pub fn add_comment_node(&mut self, text: &str) -> Result<NodeId, CodeError> {
        self.add_kind(NodeKind::Comment(text.to_string()))
    }

    pub fn add_sentinel_node(&mut self, kind: SentinelKind) -> Result<NodeId, CodeError> {
        self.add_kind(NodeKind::Sentinel(kind))
    }

    //
    // Passes
    //

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        debug!("Registered pass {}", pass.name());
        self.passes.push(pass);
    }

    fn run_passes(&mut self) -> Result<(), CodeError> {
        let mut passes = std::mem::take(&mut self.passes);
        let mut result = Ok(());

        for pass in &mut passes {
            debug!("Running pass {}", pass.name());
            result = pass.run(self);
            if result.is_err() {
                break;
            }
        }

        self.passes = passes;
        result
    }

    //
    // Finalization
    //

    /// Runs the registered passes, then re-emits every node head-to-tail
    /// onto an assembler attached to the same container. Serializing twice
    /// without touching the graph appends the same bytes again.
    pub fn finalize(&mut self) -> Result<(), CodeError> {
        self.run_passes().map_err(|error| self.report_error(error, "a pass failed"))?;

        if self.head.is_none() {
            warn!("Finalizing an empty builder graph");
        }

        let result = {
            let Self { code, nodes, head, .. } = self;
            serialize_graph(&mut **code, nodes, *head)
        };

        result.map_err(|error| self.report_error(error, "failed to serialize the node graph"))
    }
}

fn serialize_graph(code: &mut CodeContainer, nodes: &[Node], head: Option<NodeId>) -> Result<(), CodeError> {
    let mut asm = Assembler::attach(code)?;
    let mut current = head;

    while let Some(id) = current {
        let node = &nodes[id.index()];
        serialize_node(&mut asm, node)?;
        current = node.next;
    }

    Ok(())
}

fn serialize_node(asm: &mut Assembler, node: &Node) -> Result<(), CodeError> {
    if let Some(comment) = node.comment() {
        asm.set_inline_comment(comment);
    }

    match node.kind() {
        NodeKind::Inst(data) => {
            asm.add_inst_options(data.options);
            if let Some(extra) = data.extra_reg {
                asm.set_extra_reg(extra);
            }
            asm.emit(data.inst, &data.operands)
        }

        NodeKind::Label(label) => asm.bind(*label),

        NodeKind::Align { mode, alignment } => asm.align(*mode, *alignment),

        NodeKind::EmbedData { data, repeat_count, .. } => {
            for _ in 0..*repeat_count {
                asm.embed(data)?;
            }
            Ok(())
        }

        NodeKind::EmbedLabel(label) => asm.embed_label(*label),

        NodeKind::EmbedLabelDelta { label, base, width } => asm.embed_label_delta(*label, *base, *width),

        NodeKind::EmbedConstPool { label, pool } => asm.embed_const_pool(*label, pool),

        NodeKind::Comment(text) => asm.comment(text),

        NodeKind::Sentinel(_) => Ok(()),

        // A func node is a label node for the function's entry point.
        NodeKind::Func(data) => asm.bind(data.entry),

        // Return and invoke nodes carry virtual state a register-allocation
        // pass has to lower first.
        NodeKind::FuncRet(_) | NodeKind::Invoke(_) => Err(CodeError::InvalidState),

        NodeKind::Jump(data) => asm.emit(data.inst, &[data.target]),
    }
}

impl Emitter for Builder<'_> {
    fn kind(&self) -> EmitterKind {
        self.kind
    }

    fn state(&self) -> &EmitterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        &mut self.state
    }

    fn container(&self) -> &CodeContainer {
        self.code
    }

    fn container_mut(&mut self) -> &mut CodeContainer {
        self.code
    }

    fn emit(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), CodeError> {
        let data = InstData {
            inst,
            options: self.state.merged_options(),
            extra_reg: self.state.extra_reg(),
            operands: operands.to_vec(),
        };

        let result = self.add_kind(NodeKind::Inst(data));
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add instruction node"))
    }

    fn bind(&mut self, label: Label) -> Result<(), CodeError> {
        let result = self.add_label_node(label);
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add label node"))
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), CodeError> {
        if alignment > 1 && (!alignment.is_power_of_two() || alignment > MAX_ALIGNMENT) {
            return Err(self.report_error(CodeError::InvalidArgument, "alignment must be a power of two up to 64"));
        }

        let result = self.add_kind(NodeKind::Align {
            mode,
            alignment,
        });
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add align node"))
    }

    fn embed(&mut self, data: &[u8]) -> Result<(), CodeError> {
        let result = self.add_kind(NodeKind::EmbedData {
            type_id: None,
            data: data.to_vec(),
            repeat_count: 1,
        });
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add data node"))
    }

    fn embed_data_array(&mut self, type_id: TypeId, data: &[u8], item_count: usize, repeat_count: usize) -> Result<(), CodeError> {
        let item_size = type_id.size(self.code.arch().gp_size()) as usize;
        if item_size == 0 {
            return Err(self.report_error(CodeError::InvalidArgument, "cannot embed void items"));
        }

        if item_count == 0 || repeat_count == 0 {
            return Ok(());
        }

        let data_size = item_count.checked_mul(item_size);
        if data_size.and_then(|size| size.checked_mul(repeat_count)).is_none() {
            return Err(self.report_error(CodeError::OutOfMemory, "embedded array size overflows"));
        }

        if Some(data.len()) != data_size {
            return Err(self.report_error(CodeError::InvalidArgument, "data does not match item count and size"));
        }

        let result = self.add_kind(NodeKind::EmbedData {
            type_id: Some(type_id),
            data: data.to_vec(),
            repeat_count,
        });
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add data node"))
    }

    fn embed_label(&mut self, label: Label) -> Result<(), CodeError> {
        if !self.code.is_label_valid(label) {
            return Err(self.report_error(CodeError::InvalidLabel, "embedded label is invalid"));
        }

        let result = self.add_kind(NodeKind::EmbedLabel(label));
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add label-address node"))
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, width: u8) -> Result<(), CodeError> {
        if !self.code.is_label_valid(label) || !self.code.is_label_valid(base) {
            return Err(self.report_error(CodeError::InvalidLabel, "embedded label is invalid"));
        }

        let width = if width == 0 {
            self.code.arch().gp_size()
        } else {
            width
        };
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(self.report_error(CodeError::InvalidOperandSize, "label delta width must be 1, 2, 4 or 8"));
        }

        let result = self.add_kind(NodeKind::EmbedLabelDelta {
            label,
            base,
            width,
        });
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add label-delta node"))
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), CodeError> {
        if !self.code.is_label_valid(label) {
            return Err(self.report_error(CodeError::InvalidLabel, "constant pool label is invalid"));
        }

        let result = self.add_kind(NodeKind::EmbedConstPool {
            label,
            pool: pool.clone(),
        });
        self.state.reset_per_inst();
        result.map(|_| ()).map_err(|error| self.report_error(error, "failed to add constant pool node"))
    }

    fn comment(&mut self, text: &str) -> Result<(), CodeError> {
        self.add_comment_node(text).map(|_| ())
    }
}
