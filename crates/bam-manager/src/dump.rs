//! Register and FIFO dump selection.
//!
//! A dump option code names a recipe: an ordered list of steps, each either
//! a BAM-level dump or a pass over a set of pipes with one or more content
//! kinds. [`plan`] expands a recipe against a device into the flat sequence
//! of [`DumpAction`]s the pipe engine executes.

use alloc::vec::Vec;

/// Descriptor depth used by the trailing-content dump.
pub const TRAILING_DEPTH: u32 = 100;

/// Pipes dumped by the "typical" target.
pub const TYPICAL_PIPES: [u32; 2] = [4, 5];

/// Inputs of one dump request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DumpRequest {
    /// Option code selecting the recipe.
    pub option: u32,
    /// Pipe bitmask for the bitmask target.
    pub pipe_mask: u32,
    /// Test-bus selector.
    pub testbus_sel: u32,
    /// Partial-FIFO length. Zero means one entry.
    pub desc_sel: u32,
}

/// A single dump the pipe engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DumpAction {
    /// Every BAM-level register.
    BamRegs,
    /// Curated BAM-level registers for an execution environment.
    BamSelected { ee: u32 },
    TestBus { selector: u32 },
    /// A test-bus dump was requested with a zero selector.
    TestBusSelectorMissing,
    PipeRegs { pipe: u32 },
    PipeSelected { pipe: u32 },
    /// The whole descriptor FIFO.
    Fifo { pipe: u32 },
    /// The first `entries` descriptors.
    PartialFifo { pipe: u32, entries: u32 },
    /// Data behind the last `depth` descriptors.
    Trailing { pipe: u32, depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    All,
    Bitmask,
    Typical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Content {
    FullRegs,
    Selected,
    Fifo,
    PartialFifo,
    Trailing,
}

/// Order of a multi-content pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    /// One full pass over the pipes per content kind.
    Sequential,
    /// All content kinds for a pipe before moving to the next pipe.
    Interleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    BamFull,
    BamSelected,
    /// Test-bus dump. `checked` reports a zero selector instead of dumping.
    TestBus { checked: bool },
    Pipes(Target, &'static [Content], Layout),
}

use Content::*;
use Layout::*;
use Step::*;
use Target::*;

const SEL_FIFO: &[Content] = &[Selected, Fifo];
const SEL_PARTIAL: &[Content] = &[Selected, PartialFifo];
const SEL_FIFO_TRAIL: &[Content] = &[Selected, Fifo, Trailing];
const TB: Step = TestBus { checked: false };

/// Recipe for an option code, `None` for undefined codes.
pub(crate) fn recipe(option: u32) -> Option<&'static [Step]> {
    let steps: &'static [Step] = match option {
        1 => &[BamFull, Pipes(All, &[FullRegs], Sequential)],
        2 => &[BamFull],
        3 => &[BamSelected],
        4 => &[Pipes(All, &[Selected], Sequential)],
        5 => &[Pipes(Bitmask, &[Selected], Sequential)],
        6 => &[Pipes(Typical, &[Selected], Sequential)],
        7 => &[Pipes(All, &[Fifo], Sequential)],
        8 => &[Pipes(Bitmask, &[Fifo], Sequential)],
        9 => &[Pipes(Typical, &[Fifo], Sequential)],
        10 => &[Pipes(All, SEL_FIFO, Interleaved)],
        11 => &[Pipes(Bitmask, SEL_FIFO, Interleaved)],
        12 => &[Pipes(Typical, SEL_FIFO, Interleaved)],
        13 => &[TestBus { checked: true }],
        14 => &[Pipes(Bitmask, &[PartialFifo], Sequential)],
        15 => &[Pipes(Bitmask, &[Trailing], Sequential)],
        16 => &[Pipes(Bitmask, &[FullRegs], Sequential)],
        91 => &[TB, BamSelected, Pipes(All, &[Selected], Sequential)],
        92 => &[TB, BamSelected, Pipes(Bitmask, &[Selected], Sequential)],
        93 => &[TB, BamSelected, Pipes(Bitmask, SEL_PARTIAL, Sequential)],
        94 => &[TB, BamSelected, Pipes(Bitmask, SEL_PARTIAL, Interleaved)],
        95 => &[TB, BamSelected, Pipes(Bitmask, SEL_FIFO, Sequential)],
        96 => &[TB, BamSelected, Pipes(Bitmask, SEL_FIFO, Interleaved)],
        97 => &[TB, BamSelected, Pipes(Bitmask, SEL_FIFO_TRAIL, Sequential)],
        98 => {
            &[TB, BamSelected, Pipes(Bitmask, SEL_FIFO_TRAIL, Interleaved)]
        }
        99 => &[
            TB,
            BamFull,
            Pipes(All, &[FullRegs], Sequential),
            BamSelected,
            Pipes(All, SEL_FIFO_TRAIL, Sequential),
        ],
        _ => return None,
    };
    Some(steps)
}

struct Planner<'a> {
    req: &'a DumpRequest,
    num_pipes: u32,
    ee: u32,
    out: Vec<DumpAction>,
}

impl Planner<'_> {
    fn pipes(&self, target: Target) -> impl Iterator<Item = u32> + '_ {
        let range = match target {
            Typical => 0..0,
            All | Bitmask => 0..self.num_pipes.min(32),
        };
        let mask = self.req.pipe_mask;
        let typical: &'static [u32] = match target {
            Typical => &TYPICAL_PIPES,
            _ => &[],
        };
        range
            .filter(move |&i| target == All || mask & (1u32 << i) != 0)
            .chain(typical.iter().copied())
    }

    fn content(&mut self, pipe: u32, content: Content) {
        let action = match content {
            FullRegs => DumpAction::PipeRegs { pipe },
            Selected => DumpAction::PipeSelected { pipe },
            Fifo => DumpAction::Fifo { pipe },
            PartialFifo => DumpAction::PartialFifo {
                pipe,
                entries: self.req.desc_sel.max(1),
            },
            Trailing => DumpAction::Trailing { pipe, depth: TRAILING_DEPTH },
        };
        self.out.push(action);
    }

    fn step(&mut self, step: &Step) {
        match *step {
            BamFull => self.out.push(DumpAction::BamRegs),
            BamSelected => {
                self.out.push(DumpAction::BamSelected { ee: self.ee })
            }
            TestBus { checked } => {
                let selector = self.req.testbus_sel;
                if checked && selector == 0 {
                    self.out.push(DumpAction::TestBusSelectorMissing);
                } else {
                    self.out.push(DumpAction::TestBus { selector });
                }
            }
            Pipes(target, contents, Sequential) => {
                for &content in contents {
                    let pipes: Vec<u32> = self.pipes(target).collect();
                    for pipe in pipes {
                        self.content(pipe, content);
                    }
                }
            }
            Pipes(target, contents, Interleaved) => {
                let pipes: Vec<u32> = self.pipes(target).collect();
                for pipe in pipes {
                    for &content in contents {
                        self.content(pipe, content);
                    }
                }
            }
        }
    }
}

/// Expand a dump request into the ordered actions to perform on a device
/// with `num_pipes` pipes and execution environment `ee`.
///
/// Undefined option codes produce no actions.
pub fn plan(req: &DumpRequest, num_pipes: u32, ee: u32) -> Vec<DumpAction> {
    let Some(steps) = recipe(req.option) else {
        return Vec::new();
    };
    let mut planner = Planner { req, num_pipes, ee, out: Vec::new() };
    for step in steps {
        planner.step(step);
    }
    planner.out
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn every_defined_code_has_a_recipe() {
        for code in (1..=16).chain(91..=99) {
            assert!(recipe(code).is_some(), "code {}", code);
        }
        for code in [0, 17, 90, 100, u32::MAX] {
            assert!(recipe(code).is_none(), "code {}", code);
        }
    }

    #[test]
    fn plan_matches_expected_sequence_per_code() {
        use DumpAction::{
            BamRegs, BamSelected, Fifo, PartialFifo, PipeRegs, PipeSelected,
            TestBus, Trailing,
        };

        let sel = |pipe| PipeSelected { pipe };
        let regs = |pipe| PipeRegs { pipe };
        let fifo = |pipe| Fifo { pipe };
        let part = |pipe| PartialFifo { pipe, entries: 1 };
        let trail = |pipe| Trailing { pipe, depth: TRAILING_DEPTH };
        let tb = TestBus { selector: 7 };
        let bs = BamSelected { ee: 1 };

        let table: Vec<(u32, Vec<DumpAction>)> = vec![
            (1, vec![BamRegs, regs(0), regs(1), regs(2)]),
            (2, vec![BamRegs]),
            (3, vec![bs]),
            (4, vec![sel(0), sel(1), sel(2)]),
            (5, vec![sel(0), sel(2)]),
            (6, vec![sel(4), sel(5)]),
            (7, vec![fifo(0), fifo(1), fifo(2)]),
            (8, vec![fifo(0), fifo(2)]),
            (9, vec![fifo(4), fifo(5)]),
            (10, vec![sel(0), fifo(0), sel(1), fifo(1), sel(2), fifo(2)]),
            (11, vec![sel(0), fifo(0), sel(2), fifo(2)]),
            (12, vec![sel(4), fifo(4), sel(5), fifo(5)]),
            (13, vec![tb]),
            (14, vec![part(0), part(2)]),
            (15, vec![trail(0), trail(2)]),
            (16, vec![regs(0), regs(2)]),
            (91, vec![tb, bs, sel(0), sel(1), sel(2)]),
            (92, vec![tb, bs, sel(0), sel(2)]),
            (93, vec![tb, bs, sel(0), sel(2), part(0), part(2)]),
            (94, vec![tb, bs, sel(0), part(0), sel(2), part(2)]),
            (95, vec![tb, bs, sel(0), sel(2), fifo(0), fifo(2)]),
            (96, vec![tb, bs, sel(0), fifo(0), sel(2), fifo(2)]),
            (
                97,
                vec![
                    tb,
                    bs,
                    sel(0),
                    sel(2),
                    fifo(0),
                    fifo(2),
                    trail(0),
                    trail(2),
                ],
            ),
            (
                98,
                vec![
                    tb,
                    bs,
                    sel(0),
                    fifo(0),
                    trail(0),
                    sel(2),
                    fifo(2),
                    trail(2),
                ],
            ),
            (
                99,
                vec![
                    tb,
                    BamRegs,
                    regs(0),
                    regs(1),
                    regs(2),
                    bs,
                    sel(0),
                    sel(1),
                    sel(2),
                    fifo(0),
                    fifo(1),
                    fifo(2),
                    trail(0),
                    trail(1),
                    trail(2),
                ],
            ),
        ];

        for (option, expected) in table {
            let req = DumpRequest {
                option,
                pipe_mask: 0b101,
                testbus_sel: 7,
                desc_sel: 0,
            };
            assert_eq!(plan(&req, 3, 1), expected, "code {}", option);
        }
    }

    #[test]
    fn partial_fifo_uses_requested_length() {
        let req = DumpRequest {
            option: 93,
            pipe_mask: 0b10,
            testbus_sel: 1,
            desc_sel: 6,
        };
        assert_eq!(
            plan(&req, 4, 0)[3],
            DumpAction::PartialFifo { pipe: 1, entries: 6 }
        );
    }

    #[test]
    fn sequential_and_interleaved_differ_only_in_order() {
        let req = DumpRequest {
            option: 95,
            pipe_mask: 0b110,
            ..Default::default()
        };
        let seq = plan(&req, 8, 0);
        let req = DumpRequest { option: 96, ..req };
        let inter = plan(&req, 8, 0);
        assert_eq!(seq.len(), inter.len());
        assert_eq!(seq[3], DumpAction::PipeSelected { pipe: 2 });
        assert_eq!(inter[3], DumpAction::Fifo { pipe: 1 });
    }
}
