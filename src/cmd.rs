/// Represents a single command: an opcode plus raw argument payloads.
///
/// Argument encoding is the caller's concern; this type only carries the
/// bytes so that the executor and the reconnect probe can hand complete
/// commands to a transport.
#[derive(Clone, Debug)]
pub struct Cmd {
    op: String,
    args: Vec<Vec<u8>>,
}

/// Shortcut function to creating a command with a single opcode.
pub fn cmd(name: &str) -> Cmd {
    Cmd {
        op: name.to_ascii_uppercase(),
        args: Vec::new(),
    }
}

impl Cmd {
    /// Appends an argument to the command.
    pub fn arg(&mut self, arg: impl AsRef<[u8]>) -> &mut Cmd {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// The uppercased opcode.
    pub fn op(&self) -> &str {
        &self.op
    }

    /// Returns a reference to the argument at `idx`.
    pub fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        self.args.get(idx).map(|arg| &arg[..])
    }

    /// Iterates over the raw arguments.
    pub fn args_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(|arg| &arg[..])
    }

    /// Number of arguments, not counting the opcode.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}
